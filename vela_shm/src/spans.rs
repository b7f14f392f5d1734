//! Arena span enumeration: debug print and correctness oracle.
//!
//! Walks every structure that owns arena storage and emits a
//! `(start, size, name)` record per live entry. The sorted list is
//! printed at debug level with detected gaps labeled as wasted, and
//! doubles as the test oracle for the no-overlap and accounting
//! invariants.

use crate::arena::{ARENA_HDR, ExtShm, arr_size};
use crate::error::{ShmError, ShmResult};
use crate::layout::{ChangeSub, ConnState, DataDep, NotifSub, OffLen, OpDep, OperSub, RpcRecord, RpcSub};
use crate::store::ShmStore;

/// One live arena entry.
#[derive(Debug, Clone)]
pub struct Span {
    /// Arena offset of the entry.
    pub start: u64,
    /// Aligned entry size in bytes.
    pub size: u64,
    /// What the entry is, for the debug print.
    pub name: String,
}

fn push_str(spans: &mut Vec<Span>, ext: &ExtShm, off: u64, name: impl Into<String>) {
    if off != 0 {
        spans.push(Span {
            start: off,
            size: ext.str_entry_size(off),
            name: name.into(),
        });
    }
}

fn push_arr<T>(spans: &mut Vec<Span>, arr: OffLen, name: impl Into<String>) {
    if !arr.is_empty() {
        spans.push(Span {
            start: arr.off,
            size: arr_size::<T>(arr.count),
            name: name.into(),
        });
    }
}

fn push_dep_array(spans: &mut Vec<Span>, ext: &ExtShm, arr: OffLen, name: &str) {
    push_arr::<DataDep>(spans, arr, name);
    for dep in ext.slice_at::<DataDep>(arr.off, arr.count) {
        push_str(spans, ext, dep.xpath, format!("{name} xpath"));
    }
}

impl ShmStore {
    /// Enumerate every live arena span.
    pub fn arena_spans(&self) -> ShmResult<Vec<Span>> {
        let ext = &self.ext;
        let mut spans = vec![Span {
            start: 0,
            size: ARENA_HDR,
            name: "wasted counter".to_owned(),
        }];

        for idx in 0..self.main.module_count() {
            let record = self.main.module(idx);
            let name = self.module_name(idx)?.to_owned();

            push_str(&mut spans, ext, record.name, format!("mod {name} name"));
            push_arr::<u64>(&mut spans, record.features, format!("mod {name} features"));
            for &feat in ext.slice_at::<u64>(record.features.off, record.features.count) {
                push_str(&mut spans, ext, feat, format!("mod {name} feature name"));
            }

            push_dep_array(&mut spans, ext, record.data_deps, &format!("mod {name} data deps"));
            push_arr::<u64>(&mut spans, record.inv_deps, format!("mod {name} inv deps"));

            push_arr::<OpDep>(&mut spans, record.op_deps, format!("mod {name} op deps"));
            for op in ext.slice_at::<OpDep>(record.op_deps.off, record.op_deps.count) {
                push_str(&mut spans, ext, op.xpath, format!("mod {name} op dep xpath"));
                push_dep_array(&mut spans, ext, op.in_deps, &format!("mod {name} op in deps"));
                push_dep_array(&mut spans, ext, op.out_deps, &format!("mod {name} op out deps"));
            }

            for (ds, subs) in record.change_subs.iter().enumerate() {
                push_arr::<ChangeSub>(&mut spans, *subs, format!("mod {name} change subs ds{ds}"));
                for sub in ext.slice_at::<ChangeSub>(subs.off, subs.count) {
                    push_str(&mut spans, ext, sub.xpath, format!("mod {name} change sub xpath"));
                }
            }
            push_arr::<OperSub>(&mut spans, record.oper_subs, format!("mod {name} oper subs"));
            for sub in ext.slice_at::<OperSub>(record.oper_subs.off, record.oper_subs.count) {
                push_str(&mut spans, ext, sub.xpath, format!("mod {name} oper sub xpath"));
            }
            push_arr::<NotifSub>(&mut spans, record.notif_subs, format!("mod {name} notif subs"));
        }

        let conns = self.main.header().conns;
        push_arr::<ConnState>(&mut spans, conns, "connections");
        for i in 0..conns.count {
            let state: ConnState =
                ext.get(conns.off + i * std::mem::size_of::<ConnState>() as u64);
            push_arr::<u32>(
                &mut spans,
                state.evpipes,
                format!("conn {:#x} evpipes", state.conn),
            );
        }

        let rpcs = self.main.header().rpcs;
        push_arr::<RpcRecord>(&mut spans, rpcs, "rpcs");
        for i in 0..rpcs.count {
            let record: RpcRecord =
                ext.get(rpcs.off + i * std::mem::size_of::<RpcRecord>() as u64);
            let path = self.ext.str_at(record.op_path)?.to_owned();
            push_str(&mut spans, ext, record.op_path, format!("rpc {path} path"));
            push_arr::<RpcSub>(&mut spans, record.subs, format!("rpc {path} subs"));
            for sub in ext.slice_at::<RpcSub>(record.subs.off, record.subs.count) {
                push_str(&mut spans, ext, sub.xpath, format!("rpc {path} sub xpath"));
            }
        }

        spans.sort_by_key(|span| span.start);
        Ok(spans)
    }

    /// Check the no-overlap and accounting invariants.
    ///
    /// Every live entry must lie inside the mapping without overlapping
    /// any other, and `wasted + sum(live) == arena size`.
    pub fn verify_arena(&self) -> ShmResult<()> {
        let spans = self.arena_spans()?;
        let size = self.ext.size();
        let mut live = 0u64;
        let mut prev_end = 0u64;
        let mut prev_name = String::new();

        for span in &spans {
            if span.start + span.size > size {
                return Err(ShmError::Internal {
                    reason: format!(
                        "entry '{}' at {:#x}+{} exceeds the mapping ({size} bytes)",
                        span.name, span.start, span.size
                    ),
                });
            }
            if span.start < prev_end {
                return Err(ShmError::Internal {
                    reason: format!(
                        "entry '{}' at {:#x} overlaps '{prev_name}' ending at {prev_end:#x}",
                        span.name, span.start
                    ),
                });
            }
            prev_end = span.start + span.size;
            prev_name.clone_from(&span.name);
            live += span.size;
        }

        let wasted = self.ext.wasted();
        if live + wasted != size {
            return Err(ShmError::Internal {
                reason: format!(
                    "arena accounting mismatch: live {live} + wasted {wasted} != size {size}"
                ),
            });
        }
        Ok(())
    }

    /// Print the sorted span list with gaps labeled as wasted.
    ///
    /// Only emits at debug level; errors while walking are dropped.
    pub fn print_arena(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let Ok(spans) = self.arena_spans() else {
            return;
        };
        let mut cursor = 0u64;
        for span in &spans {
            if span.start > cursor {
                tracing::debug!("{cursor:#010x} +{:<6} wasted", span.start - cursor);
            }
            tracing::debug!("{:#010x} +{:<6} {}", span.start, span.size, span.name);
            cursor = span.start + span.size;
        }
        let size = self.ext.size();
        if size > cursor {
            tracing::debug!("{cursor:#010x} +{:<6} wasted", size - cursor);
        }
        tracing::debug!(
            size,
            wasted = self.ext.wasted(),
            "arena span dump complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DepImport, ModuleImport};
    use crate::layout::DepKind;

    #[test]
    fn spans_account_for_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = ShmStore::open(dir.path(), 0o600).unwrap();
        let mut m1 = ModuleImport {
            name: "m1".to_owned(),
            revision: Some("2026-01-15".to_owned()),
            features: vec!["f1".to_owned()],
            ..Default::default()
        };
        m1.data_deps = vec![DepImport {
            kind: DepKind::Ref,
            module: "m1".to_owned(),
            xpath: Some("/m1:leaf".to_owned()),
        }];
        store.add_modules(&[m1]).unwrap();
        store.conn_add(0x10, 100).unwrap();
        store.add_rpc("/m1:reset").unwrap();

        store.verify_arena().unwrap();

        // Delete something; the gap must show up as wasted, not as a
        // broken invariant.
        store.remove_rpc("/m1:reset").unwrap();
        assert!(store.ext().wasted() > 0);
        store.verify_arena().unwrap();
    }
}
