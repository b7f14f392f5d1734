//! Module registry operations on the dense main-region array.
//!
//! Insertion is bulk only: adding modules can introduce inverse
//! dependencies and foreign-augment dependencies inside previously
//! existing modules, so every `add_modules` call deletes the
//! dependencies of all existing modules and re-emits them for the full
//! set. Rebuilding is cheaper than diffing.
//!
//! Before the arena grows, a sizing pass computes the exact byte need
//! of the new contents; a final cursor check catches any emission that
//! disagrees with the sizing.

use vela::consts::REVISION_LEN;
use vela::msg::{ModuleFlags, SchemaInfo};

use crate::arena::{arr_size, str_size};
use crate::error::{ShmError, ShmResult};
use crate::layout::{DataDep, DepKind, ModuleRecord, OffLen, OpDep, RpcRecord, RpcSub};
use crate::store::ShmStore;

/// One data dependency in a module descriptor.
#[derive(Debug, Clone)]
pub struct DepImport {
    /// Dependency kind.
    pub kind: DepKind,
    /// Name of the referenced module; must be part of the registry or
    /// of the same import set.
    pub module: String,
    /// Dependency xpath, if any.
    pub xpath: Option<String>,
}

/// One operation dependency in a module descriptor.
#[derive(Debug, Clone)]
pub struct OpDepImport {
    /// Path of the operation.
    pub xpath: String,
    /// Input dependencies.
    pub in_deps: Vec<DepImport>,
    /// Output dependencies.
    pub out_deps: Vec<DepImport>,
}

/// Full descriptor of one module, as produced by the schema library.
///
/// `add_modules` takes descriptors for the complete module set — the
/// modules already in the registry plus the ones being added — because
/// every dependency table is rebuilt from them.
#[derive(Debug, Clone, Default)]
pub struct ModuleImport {
    /// Module name.
    pub name: String,
    /// Revision (`"YYYY-MM-DD"`), if any.
    pub revision: Option<String>,
    /// Whether notification replay is enabled.
    pub replay_support: bool,
    /// Enabled feature names.
    pub features: Vec<String>,
    /// Data dependencies.
    pub data_deps: Vec<DepImport>,
    /// Names of modules depending on this one.
    pub inv_deps: Vec<String>,
    /// Operation dependencies.
    pub op_deps: Vec<OpDepImport>,
}

/// A dependency with its target module resolved to a name offset.
struct ResolvedDep {
    kind: DepKind,
    module_off: u64,
    xpath: Option<String>,
}

struct ResolvedOpDep {
    xpath: String,
    in_deps: Vec<ResolvedDep>,
    out_deps: Vec<ResolvedDep>,
}

fn dep_array_bytes(deps: &[DepImport]) -> u64 {
    if deps.is_empty() {
        return 0;
    }
    let mut bytes = arr_size::<DataDep>(deps.len() as u64);
    for dep in deps {
        if let Some(xpath) = &dep.xpath {
            bytes += str_size(xpath);
        }
    }
    bytes
}

fn op_dep_array_bytes(ops: &[OpDepImport]) -> u64 {
    if ops.is_empty() {
        return 0;
    }
    let mut bytes = arr_size::<OpDep>(ops.len() as u64);
    for op in ops {
        bytes += str_size(&op.xpath);
        bytes += dep_array_bytes(&op.in_deps);
        bytes += dep_array_bytes(&op.out_deps);
    }
    bytes
}

impl ShmStore {
    /// The name of the module at `idx`.
    pub fn module_name(&self, idx: usize) -> ShmResult<&str> {
        self.ext.str_at(self.main.module(idx).name)
    }

    /// Find a module by name. O(N) scan over the dense array.
    pub fn find_module(&self, name: &str) -> Option<usize> {
        (0..self.main.module_count())
            .find(|&idx| self.ext.cstr_at(self.main.module(idx).name) == name.as_bytes())
    }

    /// Find a module by the exact arena offset of its name.
    pub fn find_module_by_off(&self, name_off: u64) -> Option<usize> {
        (0..self.main.module_count()).find(|&idx| self.main.module(idx).name == name_off)
    }

    fn module_name_off(&self, name: &str) -> ShmResult<u64> {
        self.find_module(name)
            .map(|idx| self.main.module(idx).name)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("module {name}"),
            })
    }

    /// Bulk module insertion.
    ///
    /// `imports` must describe the complete module set: every module
    /// already in the registry plus the new ones. Dependency tables of
    /// all modules are rebuilt from the descriptors. Runs under the
    /// write lock with the remap guard held for writing.
    pub fn add_modules(&mut self, imports: &[ModuleImport]) -> ShmResult<()> {
        for (n, imp) in imports.iter().enumerate() {
            if imports[..n].iter().any(|other| other.name == imp.name) {
                return Err(ShmError::Exists {
                    what: format!("duplicate descriptor for module {}", imp.name),
                });
            }
        }

        let old_count = self.main.module_count();
        for idx in 0..old_count {
            let name = self.module_name(idx)?;
            if !imports.iter().any(|imp| imp.name == name) {
                return Err(ShmError::Internal {
                    reason: format!("descriptor tree does not cover module {name}"),
                });
            }
        }

        let new_imports: Vec<usize> = (0..imports.len())
            .filter(|&n| self.find_module(&imports[n].name).is_none())
            .collect();

        // Sizing pass: exact arena bytes the new contents will need.
        let mut need = 0u64;
        for &n in &new_imports {
            let imp = &imports[n];
            need += str_size(&imp.name);
            if !imp.features.is_empty() {
                need += arr_size::<u64>(imp.features.len() as u64);
                for feature in &imp.features {
                    need += str_size(feature);
                }
            }
        }
        for imp in imports {
            need += dep_array_bytes(&imp.data_deps);
            need += arr_size::<u64>(imp.inv_deps.len() as u64);
            need += op_dep_array_bytes(&imp.op_deps);
        }
        let expected_end = self.ext.cursor() + need;
        self.ext.ensure(need)?;

        // Delete all dependencies of all existing modules; they are
        // re-emitted below for the full set.
        for idx in 0..old_count {
            self.free_module_deps(idx);
        }

        // New records, names first so dependency records can reference
        // them by offset.
        self.main.grow_modules(new_imports.len())?;
        for (slot, &n) in new_imports.iter().enumerate() {
            let imp = &imports[n];
            let name_off = self.ext.put_string(&imp.name);
            let mut revision = [0u8; REVISION_LEN];
            if let Some(rev) = &imp.revision {
                let len = rev.len().min(REVISION_LEN - 1);
                revision[..len].copy_from_slice(&rev.as_bytes()[..len]);
            }
            let flags = if imp.replay_support {
                ModuleFlags::REPLAY_SUPPORT.bits()
            } else {
                0
            };
            *self.main.module_mut(old_count + slot) = ModuleRecord::new(name_off, revision, flags);
        }

        // Feature lists of the new modules.
        for (slot, &n) in new_imports.iter().enumerate() {
            let imp = &imports[n];
            if imp.features.is_empty() {
                continue;
            }
            let offs: Vec<u64> = imp
                .features
                .iter()
                .map(|feature| self.ext.put_string(feature))
                .collect();
            let off = self.ext.put_slice(&offs);
            self.main.module_mut(old_count + slot).features = OffLen {
                off,
                count: offs.len() as u64,
            };
        }

        // Dependencies for the full set, in registry order.
        for idx in 0..self.main.module_count() {
            let name = self.module_name(idx)?.to_owned();
            let imp = imports
                .iter()
                .find(|imp| imp.name == name)
                .ok_or_else(|| ShmError::Internal {
                    reason: format!("lost descriptor for module {name}"),
                })?;

            let data = self.resolve_deps(&imp.data_deps)?;
            let inv: Vec<u64> = imp
                .inv_deps
                .iter()
                .map(|name| self.module_name_off(name))
                .collect::<ShmResult<_>>()?;
            let ops: Vec<ResolvedOpDep> = imp
                .op_deps
                .iter()
                .map(|op| {
                    Ok(ResolvedOpDep {
                        xpath: op.xpath.clone(),
                        in_deps: self.resolve_deps(&op.in_deps)?,
                        out_deps: self.resolve_deps(&op.out_deps)?,
                    })
                })
                .collect::<ShmResult<_>>()?;

            let data_arr = self.emit_deps(&data);
            let inv_off = self.ext.put_slice(&inv);
            let op_arr = self.emit_op_deps(&ops);

            let existing = idx < old_count;
            let record = self.main.module_mut(idx);
            record.data_deps = data_arr;
            record.inv_deps = OffLen {
                off: inv_off,
                count: inv.len() as u64,
            };
            record.op_deps = op_arr;
            if existing {
                record.ver += 1;
            }
        }

        if self.ext.cursor() != expected_end {
            return Err(ShmError::Internal {
                reason: format!(
                    "arena sizing mismatch after module insertion: cursor {:#x}, expected {:#x}",
                    self.ext.cursor(),
                    expected_end
                ),
            });
        }
        Ok(())
    }

    fn resolve_deps(&self, deps: &[DepImport]) -> ShmResult<Vec<ResolvedDep>> {
        deps.iter()
            .map(|dep| {
                Ok(ResolvedDep {
                    kind: dep.kind,
                    module_off: self.module_name_off(&dep.module)?,
                    xpath: dep.xpath.clone(),
                })
            })
            .collect()
    }

    fn emit_deps(&mut self, deps: &[ResolvedDep]) -> OffLen {
        if deps.is_empty() {
            return OffLen::default();
        }
        let records: Vec<DataDep> = deps
            .iter()
            .map(|dep| {
                let xpath = dep
                    .xpath
                    .as_deref()
                    .map(|x| self.ext.put_string(x))
                    .unwrap_or(0);
                DataDep::new(dep.kind, dep.module_off, xpath)
            })
            .collect();
        OffLen {
            off: self.ext.put_slice(&records),
            count: records.len() as u64,
        }
    }

    fn emit_op_deps(&mut self, ops: &[ResolvedOpDep]) -> OffLen {
        if ops.is_empty() {
            return OffLen::default();
        }
        let records: Vec<OpDep> = ops
            .iter()
            .map(|op| {
                let xpath = self.ext.put_string(&op.xpath);
                let in_deps = self.emit_deps(&op.in_deps);
                let out_deps = self.emit_deps(&op.out_deps);
                OpDep {
                    xpath,
                    in_deps,
                    out_deps,
                }
            })
            .collect();
        OffLen {
            off: self.ext.put_slice(&records),
            count: records.len() as u64,
        }
    }

    fn free_dep_array(&mut self, arr: OffLen) {
        let deps: Vec<DataDep> = self.ext.slice_at(arr.off, arr.count).to_vec();
        for dep in deps {
            self.ext.free_str(dep.xpath);
        }
        self.ext.free_arr::<DataDep>(arr);
    }

    /// Free all dependency tables of the module at `idx` into the
    /// wasted tally and zero them in the record.
    pub(crate) fn free_module_deps(&mut self, idx: usize) {
        let record = self.main.module(idx);
        let data_deps = record.data_deps;
        let inv_deps = record.inv_deps;
        let op_deps = record.op_deps;

        self.free_dep_array(data_deps);
        self.ext.free_arr::<u64>(inv_deps);

        let ops: Vec<OpDep> = self.ext.slice_at(op_deps.off, op_deps.count).to_vec();
        for op in ops {
            self.ext.free_str(op.xpath);
            self.free_dep_array(op.in_deps);
            self.free_dep_array(op.out_deps);
        }
        self.ext.free_arr::<OpDep>(op_deps);

        let record = self.main.module_mut(idx);
        record.data_deps = OffLen::default();
        record.inv_deps = OffLen::default();
        record.op_deps = OffLen::default();
    }

    /// Remove one module from the registry.
    ///
    /// Refused while other modules depend on it or any of its
    /// subscription tables is non-empty.
    pub fn remove_module(&mut self, name: &str) -> ShmResult<()> {
        let idx = self.find_module(name).ok_or_else(|| ShmError::NotFound {
            what: format!("module {name}"),
        })?;

        let record = self.main.module(idx);
        if !record.inv_deps.is_empty() {
            return Err(ShmError::Unsupported {
                what: format!("removing module {name}: other modules depend on it"),
            });
        }
        let has_subs = record.change_subs.iter().any(|subs| !subs.is_empty())
            || !record.oper_subs.is_empty()
            || !record.notif_subs.is_empty();
        if has_subs {
            return Err(ShmError::Unsupported {
                what: format!("removing module {name}: active subscriptions"),
            });
        }

        let name_off = record.name;
        let features = record.features;

        // Drop our entry from the inverse-dependency arrays of the
        // modules we reference.
        for other in 0..self.main.module_count() {
            if other == idx {
                continue;
            }
            loop {
                let inv = self.main.module(other).inv_deps;
                let pos = self
                    .ext
                    .slice_at::<u64>(inv.off, inv.count)
                    .iter()
                    .position(|&off| off == name_off);
                match pos {
                    Some(pos) => {
                        let new = self.ext.swap_remove_entry::<u64>(inv, pos as u64);
                        self.main.module_mut(other).inv_deps = new;
                    }
                    None => break,
                }
            }
        }

        self.free_module_deps(idx);
        let feature_offs: Vec<u64> = self.ext.slice_at(features.off, features.count).to_vec();
        for off in feature_offs {
            self.ext.free_str(off);
        }
        self.ext.free_arr::<u64>(features);
        self.ext.free_str(name_off);

        self.main.remove_module_record(idx)
    }

    /// Toggle notification-replay support of a module.
    pub fn update_replay_support(&mut self, name: &str, enable: bool) -> ShmResult<()> {
        let idx = self.find_module(name).ok_or_else(|| ShmError::NotFound {
            what: format!("module {name}"),
        })?;
        let record = self.main.module_mut(idx);
        let mut flags = ModuleFlags::from_bits_truncate(record.flags);
        flags.set(ModuleFlags::REPLAY_SUPPORT, enable);
        record.flags = flags.bits();
        record.ver += 1;
        Ok(())
    }

    /// The RPC record at `idx`.
    pub fn rpc(&self, idx: usize) -> RpcRecord {
        let rpcs = self.main.header().rpcs;
        debug_assert!((idx as u64) < rpcs.count);
        self.ext
            .get::<RpcRecord>(rpcs.off + idx as u64 * std::mem::size_of::<RpcRecord>() as u64)
    }

    /// Number of RPCs in the table.
    pub fn rpc_count(&self) -> usize {
        self.main.header().rpcs.count as usize
    }

    /// Find an RPC by operation path.
    pub fn find_rpc(&self, op_path: &str) -> Option<usize> {
        (0..self.rpc_count())
            .find(|&idx| self.ext.cstr_at(self.rpc(idx).op_path) == op_path.as_bytes())
    }

    /// Find an RPC by the exact arena offset of its operation path.
    pub fn find_rpc_by_off(&self, op_path_off: u64) -> Option<usize> {
        (0..self.rpc_count()).find(|&idx| self.rpc(idx).op_path == op_path_off)
    }

    /// Append an RPC to the table.
    pub fn add_rpc(&mut self, op_path: &str) -> ShmResult<()> {
        if self.find_rpc(op_path).is_some() {
            return Err(ShmError::Exists {
                what: format!("RPC {op_path}"),
            });
        }
        let rpcs = self.main.header().rpcs;
        self.ext
            .ensure(str_size(op_path) + arr_size::<RpcRecord>(rpcs.count + 1))?;
        let path_off = self.ext.put_string(op_path);
        let new = self.ext.push_entry(
            rpcs,
            RpcRecord {
                op_path: path_off,
                subs: OffLen::default(),
            },
        );
        self.main.header_mut().rpcs = new;
        Ok(())
    }

    /// Remove an RPC by operation path.
    pub fn remove_rpc(&mut self, op_path: &str) -> ShmResult<()> {
        let idx = self.find_rpc(op_path).ok_or_else(|| ShmError::NotFound {
            what: format!("RPC {op_path}"),
        })?;
        self.remove_rpc_at(idx);
        Ok(())
    }

    /// Remove an RPC by the exact arena offset of its operation path.
    pub fn remove_rpc_by_off(&mut self, op_path_off: u64) -> ShmResult<()> {
        let idx = self
            .find_rpc_by_off(op_path_off)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("RPC at offset {op_path_off:#x}"),
            })?;
        self.remove_rpc_at(idx);
        Ok(())
    }

    /// Remove the RPC at `idx`, freeing its path and subscription array.
    pub(crate) fn remove_rpc_at(&mut self, idx: usize) {
        let rpcs = self.main.header().rpcs;
        let record = self.rpc(idx);

        let subs: Vec<RpcSub> = self.ext.slice_at(record.subs.off, record.subs.count).to_vec();
        for sub in subs {
            self.ext.free_str(sub.xpath);
        }
        self.ext.free_arr::<RpcSub>(record.subs);
        self.ext.free_str(record.op_path);

        let new = self.ext.swap_remove_entry::<RpcRecord>(rpcs, idx as u64);
        self.main.header_mut().rpcs = new;
    }

    /// Schema descriptors of all modules, for `list-schemas`.
    pub fn schema_infos(&self) -> ShmResult<Vec<SchemaInfo>> {
        (0..self.main.module_count())
            .map(|idx| {
                let record = self.main.module(idx);
                let features = self
                    .ext
                    .slice_at::<u64>(record.features.off, record.features.count)
                    .to_vec()
                    .into_iter()
                    .map(|off| self.ext.str_at(off).map(str::to_owned))
                    .collect::<ShmResult<Vec<_>>>()?;
                Ok(SchemaInfo {
                    name: self.module_name(idx)?.to_owned(),
                    revision: record.revision_str().map(str::to_owned),
                    features,
                    replay_support: ModuleFlags::from_bits_truncate(record.flags)
                        .contains(ModuleFlags::REPLAY_SUPPORT),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ShmStore) {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = ShmStore::open(dir.path(), 0o600).unwrap();
        (dir, store)
    }

    fn simple_module(name: &str) -> ModuleImport {
        ModuleImport {
            name: name.to_owned(),
            revision: Some("2026-01-15".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn add_and_find_single_module() {
        let (_dir, mut store) = temp_store();
        let mut imp = simple_module("m1");
        imp.features = vec!["f1".to_owned()];
        imp.data_deps = vec![DepImport {
            kind: DepKind::Ref,
            module: "m1".to_owned(),
            xpath: None,
        }];
        store.add_modules(&[imp]).unwrap();

        let idx = store.find_module("m1").unwrap();
        assert_eq!(store.module_name(idx).unwrap(), "m1");
        let record = store.main().module(idx);
        assert_eq!(record.features.count, 1);
        assert_eq!(record.data_deps.count, 1);
        assert_eq!(record.revision_str(), Some("2026-01-15"));
        assert_eq!(store.ext().wasted(), 0);

        let name_off = record.name;
        assert_eq!(store.find_module_by_off(name_off), Some(idx));
        assert_eq!(store.find_module("m2"), None);
    }

    #[test]
    fn incremental_add_rebuilds_dependencies() {
        let (_dir, mut store) = temp_store();
        store.add_modules(&[simple_module("m1")]).unwrap();
        assert_eq!(store.ext().wasted(), 0);
        let ver_before = store.main().module(0).ver;

        // m2 depends on m1; m1 gains an inverse dependency.
        let mut m1 = simple_module("m1");
        m1.inv_deps = vec!["m2".to_owned()];
        let mut m2 = simple_module("m2");
        m2.data_deps = vec![DepImport {
            kind: DepKind::Ref,
            module: "m1".to_owned(),
            xpath: Some("/m1:root".to_owned()),
        }];
        store.add_modules(&[m1, m2]).unwrap();

        let m1_idx = store.find_module("m1").unwrap();
        let m2_idx = store.find_module("m2").unwrap();
        assert_eq!(store.main().module(m1_idx).inv_deps.count, 1);
        assert!(store.main().module(m1_idx).ver > ver_before);

        let deps = store.main().module(m2_idx).data_deps;
        let dep: DataDep = store.ext().get(deps.off);
        assert_eq!(dep.module, store.main().module(m1_idx).name);
        assert_eq!(store.ext().str_at(dep.xpath).unwrap(), "/m1:root");
    }

    #[test]
    fn add_modules_requires_full_coverage() {
        let (_dir, mut store) = temp_store();
        store.add_modules(&[simple_module("m1")]).unwrap();
        let err = store.add_modules(&[simple_module("m2")]).unwrap_err();
        assert!(matches!(err, ShmError::Internal { .. }));
    }

    #[test]
    fn add_modules_rejects_unknown_dep_target() {
        let (_dir, mut store) = temp_store();
        let mut m1 = simple_module("m1");
        m1.data_deps = vec![DepImport {
            kind: DepKind::InstId,
            module: "missing".to_owned(),
            xpath: None,
        }];
        let err = store.add_modules(&[m1]).unwrap_err();
        assert!(matches!(err, ShmError::NotFound { .. }));
    }

    #[test]
    fn replay_support_toggles_and_bumps_version() {
        let (_dir, mut store) = temp_store();
        store.add_modules(&[simple_module("m1")]).unwrap();
        let ver = store.main().module(0).ver;

        store.update_replay_support("m1", true).unwrap();
        let record = store.main().module(0);
        assert!(ModuleFlags::from_bits_truncate(record.flags).contains(ModuleFlags::REPLAY_SUPPORT));
        assert_eq!(record.ver, ver + 1);

        store.update_replay_support("m1", false).unwrap();
        let record = store.main().module(0);
        assert!(!ModuleFlags::from_bits_truncate(record.flags).contains(ModuleFlags::REPLAY_SUPPORT));

        assert!(matches!(
            store.update_replay_support("nope", true),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn rpc_add_remove_swaps_last_into_hole() {
        let (_dir, mut store) = temp_store();
        store.add_rpc("/m1:reset").unwrap();
        store.add_rpc("/m1:reboot").unwrap();
        store.add_rpc("/m1:ping").unwrap();
        assert_eq!(store.rpc_count(), 3);
        assert!(matches!(
            store.add_rpc("/m1:ping"),
            Err(ShmError::Exists { .. })
        ));

        store.remove_rpc("/m1:reset").unwrap();
        assert_eq!(store.rpc_count(), 2);
        assert!(store.find_rpc("/m1:reset").is_none());
        assert!(store.find_rpc("/m1:reboot").is_some());
        assert!(store.find_rpc("/m1:ping").is_some());

        store.remove_rpc("/m1:reboot").unwrap();
        store.remove_rpc("/m1:ping").unwrap();
        assert_eq!(store.rpc_count(), 0);
        assert!(store.main().header().rpcs.is_empty());
        // Everything the table ever used is accounted as wasted.
        assert_eq!(
            store.ext().wasted() + crate::arena::ARENA_HDR,
            store.ext().size()
        );
    }

    #[test]
    fn remove_module_refuses_referenced_modules() {
        let (_dir, mut store) = temp_store();
        let mut m1 = simple_module("m1");
        m1.inv_deps = vec!["m2".to_owned()];
        let mut m2 = simple_module("m2");
        m2.data_deps = vec![DepImport {
            kind: DepKind::Ref,
            module: "m1".to_owned(),
            xpath: None,
        }];
        store.add_modules(&[m1, m2]).unwrap();

        assert!(matches!(
            store.remove_module("m1"),
            Err(ShmError::Unsupported { .. })
        ));

        // m2 references m1 but nothing references m2.
        store.remove_module("m2").unwrap();
        assert_eq!(store.main().module_count(), 1);
        assert!(store.find_module("m2").is_none());
        // m1's inverse-dependency entry for m2 is gone.
        assert!(store.main().module(0).inv_deps.is_empty());
    }

    #[test]
    fn schema_infos_reflect_records() {
        let (_dir, mut store) = temp_store();
        let mut m1 = simple_module("m1");
        m1.features = vec!["f1".to_owned(), "f2".to_owned()];
        m1.replay_support = true;
        store.add_modules(&[m1]).unwrap();

        let infos = store.schema_infos().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "m1");
        assert_eq!(infos[0].revision.as_deref(), Some("2026-01-15"));
        assert_eq!(infos[0].features, vec!["f1", "f2"]);
        assert!(infos[0].replay_support);
    }
}
