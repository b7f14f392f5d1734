//! Defragmentation: the compacting rewrite of the arena.
//!
//! Runs under the write side of the remap guard. Live data is rewritten
//! into a fresh buffer of exactly `arena_size - wasted_bytes` in a
//! canonical order: module names first (so dependency records can be
//! repointed), then per-module arrays, then connections with their
//! event-pipe arrays, then the RPC table with its subscription arrays.
//!
//! Offset fixups for the main region are collected during the rewrite
//! and applied only after the final cursor check passes, so a rewrite
//! that disagrees with the accounting leaves the registry untouched.

use vela::consts::DS_COUNT;

use crate::arena::{ARENA_HDR, ExtShm, shm_size};
use crate::error::{ShmError, ShmResult};
use crate::layout::{ChangeSub, ConnState, DataDep, OffLen, OpDep, RpcRecord, RpcSub};
use crate::store::ShmStore;

/// Compacted-image writer; allocation mirrors the arena's alignment.
struct Rewriter<'a> {
    old: &'a ExtShm,
    buf: Vec<u8>,
}

impl Rewriter<'_> {
    fn alloc(&mut self, len: u64) -> u64 {
        let off = self.buf.len() as u64;
        self.buf.resize((off + shm_size(len)) as usize, 0);
        off
    }

    /// Copy the NUL-terminated string at `old_off`; 0 stays absent.
    fn copy_string(&mut self, old_off: u64) -> u64 {
        if old_off == 0 {
            return 0;
        }
        let bytes = self.old.cstr_at(old_off).to_vec();
        let off = self.alloc(bytes.len() as u64 + 1);
        self.buf[off as usize..off as usize + bytes.len()].copy_from_slice(&bytes);
        off
    }

    fn put_slice<T: Copy>(&mut self, vals: &[T]) -> u64 {
        if vals.is_empty() {
            return 0;
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(vals.as_ptr() as *const u8, std::mem::size_of_val(vals))
        };
        let off = self.alloc(bytes.len() as u64);
        self.buf[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
        off
    }

    fn set_val<T: Copy>(&mut self, off: u64, val: T) {
        let size = std::mem::size_of::<T>();
        debug_assert!(off as usize + size <= self.buf.len());
        unsafe {
            (self.buf.as_mut_ptr().add(off as usize) as *mut T).write_unaligned(val);
        }
    }
}

/// New main-region offsets of one module, applied after the check.
#[derive(Default)]
struct ModFix {
    name: u64,
    features: u64,
    data_deps: u64,
    inv_deps: u64,
    op_deps: u64,
    change_subs: [u64; DS_COUNT],
    oper_subs: u64,
    notif_subs: u64,
}

impl ShmStore {
    /// Compact the arena, resetting the wasted tally to 0.
    ///
    /// The caller holds the write side of the remap guard; every other
    /// attached process is excluded from the arena for the duration.
    pub fn defragment(&mut self) -> ShmResult<()> {
        let wasted = self.ext.wasted();
        let old_size = self.ext.size();
        let expected = old_size - wasted;
        let mod_count = self.main.module_count();

        let mut rw = Rewriter {
            old: &self.ext,
            buf: Vec::with_capacity(expected as usize),
        };
        rw.alloc(ARENA_HDR); // zeroed wasted counter

        // Module names first; dependency records are repointed through
        // this map.
        let mut name_map: Vec<(u64, u64)> = Vec::with_capacity(mod_count);
        let mut fixes: Vec<ModFix> = Vec::with_capacity(mod_count);
        for idx in 0..mod_count {
            let old_name = self.main.module(idx).name;
            let new_name = rw.copy_string(old_name);
            name_map.push((old_name, new_name));
            fixes.push(ModFix {
                name: new_name,
                ..Default::default()
            });
        }
        let map_name = |old: u64| -> ShmResult<u64> {
            name_map
                .iter()
                .find(|&&(from, _)| from == old)
                .map(|&(_, to)| to)
                .ok_or_else(|| ShmError::Internal {
                    reason: format!("dangling module reference {old:#x} during compaction"),
                })
        };

        for idx in 0..mod_count {
            let record = self.main.module(idx);
            let features = record.features;
            let data_deps = record.data_deps;
            let inv_deps = record.inv_deps;
            let op_deps = record.op_deps;
            let change_subs = record.change_subs;
            let oper_subs = record.oper_subs;
            let notif_subs = record.notif_subs;

            let feats: Vec<u64> = self.ext.slice_at::<u64>(features.off, features.count).to_vec();
            let new_feats: Vec<u64> = feats.iter().map(|&off| rw.copy_string(off)).collect();
            fixes[idx].features = rw.put_slice(&new_feats);

            fixes[idx].data_deps = copy_dep_array(&mut rw, self, data_deps, &map_name)?;

            let invs: Vec<u64> = self.ext.slice_at::<u64>(inv_deps.off, inv_deps.count).to_vec();
            let new_invs: Vec<u64> =
                invs.iter().map(|&off| map_name(off)).collect::<ShmResult<_>>()?;
            fixes[idx].inv_deps = rw.put_slice(&new_invs);

            let ops: Vec<OpDep> = self.ext.slice_at(op_deps.off, op_deps.count).to_vec();
            let mut new_ops: Vec<OpDep> = Vec::with_capacity(ops.len());
            for op in &ops {
                let xpath = rw.copy_string(op.xpath);
                let in_off = copy_dep_array(&mut rw, self, op.in_deps, &map_name)?;
                let out_off = copy_dep_array(&mut rw, self, op.out_deps, &map_name)?;
                new_ops.push(OpDep {
                    xpath,
                    in_deps: OffLen {
                        off: in_off,
                        count: op.in_deps.count,
                    },
                    out_deps: OffLen {
                        off: out_off,
                        count: op.out_deps.count,
                    },
                });
            }
            fixes[idx].op_deps = rw.put_slice(&new_ops);

            for ds in 0..DS_COUNT {
                let subs: Vec<ChangeSub> = self
                    .ext
                    .slice_at(change_subs[ds].off, change_subs[ds].count)
                    .to_vec();
                let new_subs: Vec<ChangeSub> = subs
                    .iter()
                    .map(|sub| ChangeSub {
                        xpath: rw.copy_string(sub.xpath),
                        ..*sub
                    })
                    .collect();
                fixes[idx].change_subs[ds] = rw.put_slice(&new_subs);
            }

            let opers: Vec<crate::layout::OperSub> =
                self.ext.slice_at(oper_subs.off, oper_subs.count).to_vec();
            let new_opers: Vec<crate::layout::OperSub> = opers
                .iter()
                .map(|sub| crate::layout::OperSub {
                    xpath: rw.copy_string(sub.xpath),
                    ..*sub
                })
                .collect();
            fixes[idx].oper_subs = rw.put_slice(&new_opers);

            let notifs: Vec<crate::layout::NotifSub> =
                self.ext.slice_at(notif_subs.off, notif_subs.count).to_vec();
            fixes[idx].notif_subs = rw.put_slice(&notifs);
        }

        // Connection array, then each connection's event-pipe array.
        let conns = self.main.header().conns;
        let mut new_conns = 0u64;
        if conns.count > 0 {
            let conn_size = std::mem::size_of::<ConnState>() as u64;
            new_conns = rw.alloc(conns.count * conn_size);
            for i in 0..conns.count {
                let mut state: ConnState = self.ext.get(conns.off + i * conn_size);
                let pipes: Vec<u32> = self
                    .ext
                    .slice_at(state.evpipes.off, state.evpipes.count)
                    .to_vec();
                state.evpipes.off = rw.put_slice(&pipes);
                rw.set_val(new_conns + i * conn_size, state);
            }
        }

        // RPC table, then each RPC's subscription array.
        let rpcs = self.main.header().rpcs;
        let mut new_rpcs = 0u64;
        if rpcs.count > 0 {
            let rpc_size = std::mem::size_of::<RpcRecord>() as u64;
            new_rpcs = rw.alloc(rpcs.count * rpc_size);
            for i in 0..rpcs.count {
                let mut record: RpcRecord = self.ext.get(rpcs.off + i * rpc_size);
                let op_path = rw.copy_string(record.op_path);
                let subs: Vec<RpcSub> = self
                    .ext
                    .slice_at(record.subs.off, record.subs.count)
                    .to_vec();
                let new_subs: Vec<RpcSub> = subs
                    .iter()
                    .map(|sub| RpcSub {
                        xpath: rw.copy_string(sub.xpath),
                        ..*sub
                    })
                    .collect();
                record.op_path = op_path;
                record.subs.off = rw.put_slice(&new_subs);
                rw.set_val(new_rpcs + i * rpc_size, record);
            }
        }

        if rw.buf.len() as u64 != expected {
            return Err(ShmError::Internal {
                reason: format!(
                    "compaction cursor mismatch: wrote {:#x}, expected {:#x}",
                    rw.buf.len(),
                    expected
                ),
            });
        }
        let image = rw.buf;

        // The image checked out; commit the new offsets.
        for (idx, fix) in fixes.iter().enumerate() {
            let record = self.main.module_mut(idx);
            record.name = fix.name;
            record.features.off = fix.features;
            record.data_deps.off = fix.data_deps;
            record.inv_deps.off = fix.inv_deps;
            record.op_deps.off = fix.op_deps;
            for ds in 0..DS_COUNT {
                record.change_subs[ds].off = fix.change_subs[ds];
            }
            record.oper_subs.off = fix.oper_subs;
            record.notif_subs.off = fix.notif_subs;
        }
        let header = self.main.header_mut();
        header.conns.off = new_conns;
        header.rpcs.off = new_rpcs;

        self.ext.replace(&image)?;
        tracing::debug!(
            old_size,
            new_size = expected,
            reclaimed = wasted,
            "arena compacted"
        );
        Ok(())
    }
}

fn copy_dep_array(
    rw: &mut Rewriter<'_>,
    store: &ShmStore,
    arr: OffLen,
    map_name: &impl Fn(u64) -> ShmResult<u64>,
) -> ShmResult<u64> {
    let deps: Vec<DataDep> = store.ext().slice_at(arr.off, arr.count).to_vec();
    let mut new_deps: Vec<DataDep> = Vec::with_capacity(deps.len());
    for dep in &deps {
        new_deps.push(DataDep {
            module: map_name(dep.module)?,
            xpath: rw.copy_string(dep.xpath),
            ..*dep
        });
    }
    Ok(rw.put_slice(&new_deps))
}
