//! Registry mutation and defragmentation integration tests.

use vela::msg::{ChangeSubOpts, Datastore};
use vela_shm::arena::ARENA_HDR;
use vela_shm::layout::{DataDep, DepKind};
use vela_shm::registry::{DepImport, ModuleImport, OpDepImport};
use vela_shm::store::ShmStore;

fn temp_store() -> (tempfile::TempDir, ShmStore) {
    let dir = tempfile::tempdir().unwrap();
    let (store, created) = ShmStore::open(dir.path(), 0o600).unwrap();
    assert!(created);
    (dir, store)
}

fn m1_import() -> ModuleImport {
    ModuleImport {
        name: "m1".to_owned(),
        revision: Some("2026-01-15".to_owned()),
        features: vec!["f1".to_owned()],
        data_deps: vec![DepImport {
            kind: DepKind::Ref,
            module: "m1".to_owned(),
            xpath: Some("/m1:leaf".to_owned()),
        }],
        ..Default::default()
    }
}

/// Single-module add: all fields land, nothing is wasted.
#[test]
fn single_module_add() {
    let (_dir, mut store) = temp_store();
    store.add_modules(&[m1_import()]).unwrap();

    let idx = store.find_module("m1").unwrap();
    let record = store.main().module(idx);
    assert_eq!(store.module_name(idx).unwrap(), "m1");
    assert_eq!(record.features.count, 1);
    assert_eq!(record.data_deps.count, 1);
    assert_eq!(store.ext().wasted(), 0);
    store.verify_arena().unwrap();
}

/// Rebuild waste plus re-add compacts back to the scenario-1 state.
#[test]
fn defrag_equivalence_after_dep_churn() {
    let (_dir, mut store) = temp_store();
    store.add_modules(&[m1_import()]).unwrap();
    let baseline_size = store.ext().size();

    // Drop the dependency (rebuild without it), then restore it.
    let mut without_dep = m1_import();
    without_dep.data_deps.clear();
    store.add_modules(&[without_dep]).unwrap();
    assert!(store.ext().wasted() > 0);
    store.add_modules(&[m1_import()]).unwrap();
    store.verify_arena().unwrap();

    let wasted = store.ext().wasted();
    let size_before = store.ext().size();
    store.defragment().unwrap();

    // The compacted arena is exactly the live bytes.
    assert_eq!(store.ext().size(), size_before - wasted);
    assert_eq!(store.ext().wasted(), 0);
    assert_eq!(store.ext().size(), baseline_size);
    store.verify_arena().unwrap();

    // Live content matches the single-add state bit-for-bit where it
    // matters: name, feature, dependency fields.
    let idx = store.find_module("m1").unwrap();
    let record = store.main().module(idx);
    assert_eq!(store.module_name(idx).unwrap(), "m1");
    assert_eq!(record.revision_str(), Some("2026-01-15"));
    let feats: Vec<u64> = store
        .ext()
        .slice_at::<u64>(record.features.off, record.features.count)
        .to_vec();
    assert_eq!(store.ext().str_at(feats[0]).unwrap(), "f1");
    let dep: DataDep = store.ext().get(record.data_deps.off);
    assert_eq!(dep.kind, DepKind::Ref as u32);
    assert_eq!(dep.module, record.name);
    assert_eq!(store.ext().str_at(dep.xpath).unwrap(), "/m1:leaf");
}

/// With nothing wasted, compaction is bit-identical.
#[test]
fn defrag_is_idempotent_on_compact_arena() {
    let (_dir, mut store) = temp_store();
    store.add_modules(&[m1_import()]).unwrap();
    store.add_rpc("/m1:reset").unwrap();
    store.conn_add(0x77, 0x7FFF_FFFE).unwrap();

    // First pass canonicalizes the order.
    store.defragment().unwrap();
    let canonical = store.ext().bytes().to_vec();

    store.defragment().unwrap();
    assert_eq!(store.ext().bytes(), &canonical[..]);
    store.verify_arena().unwrap();
}

/// Defragmentation preserves a fully loaded registry.
#[test]
fn defrag_preserves_complex_content() {
    let (_dir, mut store) = temp_store();
    let mut m1 = m1_import();
    m1.op_deps = vec![OpDepImport {
        xpath: "/m1:reset".to_owned(),
        in_deps: vec![DepImport {
            kind: DepKind::InstId,
            module: "m1".to_owned(),
            xpath: Some("/m1:target".to_owned()),
        }],
        out_deps: vec![],
    }];
    let mut m2 = ModuleImport {
        name: "m2".to_owned(),
        ..Default::default()
    };
    m2.data_deps = vec![DepImport {
        kind: DepKind::Ref,
        module: "m1".to_owned(),
        xpath: None,
    }];
    let mut m1_full = m1.clone();
    m1_full.inv_deps = vec!["m2".to_owned()];
    store.add_modules(&[m1_full, m2]).unwrap();

    let m1_idx = store.find_module("m1").unwrap();
    store
        .change_sub_add(m1_idx, Datastore::Running, Some("/m1:leaf"), 3, ChangeSubOpts::UPDATE, 7)
        .unwrap();
    store.oper_sub_add(m1_idx, "/m1:state", 7).unwrap();
    store.notif_sub_add(m1_idx, 7).unwrap();
    store.add_rpc("/m1:reset").unwrap();
    let rpc_idx = store.find_rpc("/m1:reset").unwrap();
    store.rpc_sub_add(rpc_idx, "/m1:reset", 0, 7).unwrap();
    store.conn_add(0x42, 0x7FFF_FFFE).unwrap();
    let conn_idx = store.conn_find(0x42, 0x7FFF_FFFE).unwrap();
    store.evpipe_add(conn_idx, 7).unwrap();

    store.defragment().unwrap();
    assert_eq!(store.ext().wasted(), 0);
    store.verify_arena().unwrap();

    // Cross-module references still resolve after the rewrite.
    let m1_idx = store.find_module("m1").unwrap();
    let m2_idx = store.find_module("m2").unwrap();
    let dep: DataDep = store.ext().get(store.main().module(m2_idx).data_deps.off);
    assert_eq!(dep.module, store.main().module(m1_idx).name);

    let record = store.main().module(m1_idx);
    assert_eq!(record.change_subs[Datastore::Running as usize].count, 1);
    assert_eq!(record.oper_subs.count, 1);
    assert_eq!(record.notif_subs.count, 1);
    let rpc_idx = store.find_rpc("/m1:reset").unwrap();
    assert_eq!(store.rpc(rpc_idx).subs.count, 1);
    let conn_idx = store.conn_find(0x42, 0x7FFF_FFFE).unwrap();
    assert_eq!(store.evpipes(conn_idx), &[7]);
}

/// Modules and RPCs survive find-by-offset lookups after compaction.
#[test]
fn find_by_offset_after_defrag() {
    let (_dir, mut store) = temp_store();
    store.add_modules(&[m1_import()]).unwrap();
    store.add_rpc("/m1:reset").unwrap();
    store.defragment().unwrap();

    let idx = store.find_module("m1").unwrap();
    let name_off = store.main().module(idx).name;
    assert_eq!(store.find_module_by_off(name_off), Some(idx));

    let rpc_idx = store.find_rpc("/m1:reset").unwrap();
    let path_off = store.rpc(rpc_idx).op_path;
    assert_eq!(store.find_rpc_by_off(path_off), Some(rpc_idx));
    store.remove_rpc_by_off(path_off).unwrap();
    assert_eq!(store.rpc_count(), 0);
}

/// A fresh store compacts to just the arena header.
#[test]
fn defrag_of_empty_store() {
    let (_dir, mut store) = temp_store();
    store.defragment().unwrap();
    assert_eq!(store.ext().size(), ARENA_HDR);
    store.verify_arena().unwrap();
}
