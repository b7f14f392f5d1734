//! Subscription tables: change, operational, notification and RPC.
//!
//! All four kinds follow the same arena pattern: append-to-tail with
//! table relocation, swap-on-delete, wasted-bytes accounting. Change
//! subscriptions are keyed by `(xpath, priority)` for targeted removal;
//! every kind also supports removal by event-pipe id, which crash
//! recovery uses to purge a dead subscriber.

use vela::msg::{ChangeSubOpts, Datastore};

use crate::arena::{arr_size, str_size};
use crate::error::{ShmError, ShmResult};
use crate::layout::{ChangeSub, NotifSub, OperSub, RpcRecord, RpcSub};
use crate::store::ShmStore;

const RPC_SIZE: u64 = std::mem::size_of::<RpcRecord>() as u64;

impl ShmStore {
    fn sub_xpath_matches(&self, stored: u64, wanted: Option<&str>) -> bool {
        match wanted {
            None => stored == 0,
            Some(x) => stored != 0 && self.ext.cstr_at(stored) == x.as_bytes(),
        }
    }

    /// Register a change subscription on `(module, datastore)`.
    ///
    /// `(xpath, priority)` identifies the subscription for removal, so
    /// duplicates are refused.
    pub fn change_sub_add(
        &mut self,
        mod_idx: usize,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: ChangeSubOpts,
        evpipe: u32,
    ) -> ShmResult<()> {
        let subs = self.main.module(mod_idx).change_subs[ds as usize];
        let existing = self
            .ext
            .slice_at::<ChangeSub>(subs.off, subs.count)
            .iter()
            .any(|sub| sub.priority == priority && self.sub_xpath_matches(sub.xpath, xpath));
        if existing {
            return Err(ShmError::Exists {
                what: format!("change subscription ({xpath:?}, {priority})"),
            });
        }

        let xpath_bytes = xpath.map(str_size).unwrap_or(0);
        self.ext
            .ensure(xpath_bytes + arr_size::<ChangeSub>(subs.count + 1))?;
        let xpath_off = xpath.map(|x| self.ext.put_string(x)).unwrap_or(0);
        let new = self
            .ext
            .push_entry(subs, ChangeSub::new(xpath_off, priority, opts.bits(), evpipe));
        self.main.module_mut(mod_idx).change_subs[ds as usize] = new;
        Ok(())
    }

    /// Remove the change subscription keyed by `(xpath, priority)`.
    pub fn change_sub_remove(
        &mut self,
        mod_idx: usize,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
    ) -> ShmResult<()> {
        let subs = self.main.module(mod_idx).change_subs[ds as usize];
        let pos = self
            .ext
            .slice_at::<ChangeSub>(subs.off, subs.count)
            .iter()
            .position(|sub| sub.priority == priority && self.sub_xpath_matches(sub.xpath, xpath))
            .ok_or_else(|| ShmError::NotFound {
                what: format!("change subscription ({xpath:?}, {priority})"),
            })?;
        self.change_sub_remove_at(mod_idx, ds, pos);
        Ok(())
    }

    fn change_sub_remove_at(&mut self, mod_idx: usize, ds: Datastore, pos: usize) {
        let subs = self.main.module(mod_idx).change_subs[ds as usize];
        let sub: ChangeSub = self
            .ext
            .get(subs.off + pos as u64 * std::mem::size_of::<ChangeSub>() as u64);
        self.ext.free_str(sub.xpath);
        let new = self.ext.swap_remove_entry::<ChangeSub>(subs, pos as u64);
        self.main.module_mut(mod_idx).change_subs[ds as usize] = new;
    }

    /// Remove all change subscriptions of one event pipe; returns how
    /// many were removed.
    pub(crate) fn change_sub_remove_by_evpipe(
        &mut self,
        mod_idx: usize,
        ds: Datastore,
        evpipe: u32,
    ) -> usize {
        let mut removed = 0;
        loop {
            let subs = self.main.module(mod_idx).change_subs[ds as usize];
            let pos = self
                .ext
                .slice_at::<ChangeSub>(subs.off, subs.count)
                .iter()
                .position(|sub| sub.evpipe == evpipe);
            match pos {
                Some(pos) => {
                    self.change_sub_remove_at(mod_idx, ds, pos);
                    removed += 1;
                }
                None => return removed,
            }
        }
    }

    /// Register an operational-data subscription.
    pub fn oper_sub_add(&mut self, mod_idx: usize, xpath: &str, evpipe: u32) -> ShmResult<()> {
        let subs = self.main.module(mod_idx).oper_subs;
        let existing = self
            .ext
            .slice_at::<OperSub>(subs.off, subs.count)
            .iter()
            .any(|sub| self.ext.cstr_at(sub.xpath) == xpath.as_bytes());
        if existing {
            return Err(ShmError::Exists {
                what: format!("operational subscription {xpath}"),
            });
        }

        self.ext
            .ensure(str_size(xpath) + arr_size::<OperSub>(subs.count + 1))?;
        let xpath_off = self.ext.put_string(xpath);
        let new = self.ext.push_entry(subs, OperSub::new(xpath_off, evpipe));
        self.main.module_mut(mod_idx).oper_subs = new;
        Ok(())
    }

    /// Remove the operational-data subscription providing `xpath`.
    pub fn oper_sub_remove(&mut self, mod_idx: usize, xpath: &str) -> ShmResult<()> {
        let subs = self.main.module(mod_idx).oper_subs;
        let pos = self
            .ext
            .slice_at::<OperSub>(subs.off, subs.count)
            .iter()
            .position(|sub| self.ext.cstr_at(sub.xpath) == xpath.as_bytes())
            .ok_or_else(|| ShmError::NotFound {
                what: format!("operational subscription {xpath}"),
            })?;
        self.oper_sub_remove_at(mod_idx, pos);
        Ok(())
    }

    fn oper_sub_remove_at(&mut self, mod_idx: usize, pos: usize) {
        let subs = self.main.module(mod_idx).oper_subs;
        let sub: OperSub = self
            .ext
            .get(subs.off + pos as u64 * std::mem::size_of::<OperSub>() as u64);
        self.ext.free_str(sub.xpath);
        let new = self.ext.swap_remove_entry::<OperSub>(subs, pos as u64);
        self.main.module_mut(mod_idx).oper_subs = new;
    }

    /// Remove all operational subscriptions of one event pipe.
    pub(crate) fn oper_sub_remove_by_evpipe(&mut self, mod_idx: usize, evpipe: u32) -> usize {
        let mut removed = 0;
        loop {
            let subs = self.main.module(mod_idx).oper_subs;
            let pos = self
                .ext
                .slice_at::<OperSub>(subs.off, subs.count)
                .iter()
                .position(|sub| sub.evpipe == evpipe);
            match pos {
                Some(pos) => {
                    self.oper_sub_remove_at(mod_idx, pos);
                    removed += 1;
                }
                None => return removed,
            }
        }
    }

    /// Register a notification subscription.
    pub fn notif_sub_add(&mut self, mod_idx: usize, evpipe: u32) -> ShmResult<()> {
        let subs = self.main.module(mod_idx).notif_subs;
        self.ext.ensure(arr_size::<NotifSub>(subs.count + 1))?;
        let new = self.ext.push_entry(subs, NotifSub::new(evpipe));
        self.main.module_mut(mod_idx).notif_subs = new;
        Ok(())
    }

    /// Remove one notification subscription of `evpipe`.
    pub fn notif_sub_remove(&mut self, mod_idx: usize, evpipe: u32) -> ShmResult<()> {
        let subs = self.main.module(mod_idx).notif_subs;
        let pos = self
            .ext
            .slice_at::<NotifSub>(subs.off, subs.count)
            .iter()
            .position(|sub| sub.evpipe == evpipe)
            .ok_or_else(|| ShmError::NotFound {
                what: format!("notification subscription of event pipe {evpipe}"),
            })?;
        let new = self.ext.swap_remove_entry::<NotifSub>(subs, pos as u64);
        self.main.module_mut(mod_idx).notif_subs = new;
        Ok(())
    }

    /// Remove all notification subscriptions of one event pipe.
    pub(crate) fn notif_sub_remove_by_evpipe(&mut self, mod_idx: usize, evpipe: u32) -> usize {
        let mut removed = 0;
        while self.notif_sub_remove(mod_idx, evpipe).is_ok() {
            removed += 1;
        }
        removed
    }

    fn write_rpc(&mut self, rpc_idx: usize, record: RpcRecord) {
        let rpcs = self.main.header().rpcs;
        debug_assert!((rpc_idx as u64) < rpcs.count);
        self.ext.set(rpcs.off + rpc_idx as u64 * RPC_SIZE, record);
    }

    /// Register an RPC subscription.
    pub fn rpc_sub_add(
        &mut self,
        rpc_idx: usize,
        xpath: &str,
        priority: u32,
        evpipe: u32,
    ) -> ShmResult<()> {
        let mut record = self.rpc(rpc_idx);
        let existing = self
            .ext
            .slice_at::<RpcSub>(record.subs.off, record.subs.count)
            .iter()
            .any(|sub| {
                sub.priority == priority && self.ext.cstr_at(sub.xpath) == xpath.as_bytes()
            });
        if existing {
            return Err(ShmError::Exists {
                what: format!("RPC subscription ({xpath}, {priority})"),
            });
        }

        self.ext
            .ensure(str_size(xpath) + arr_size::<RpcSub>(record.subs.count + 1))?;
        let xpath_off = self.ext.put_string(xpath);
        record.subs = self.ext.push_entry(
            record.subs,
            RpcSub {
                xpath: xpath_off,
                priority,
                evpipe,
            },
        );
        self.write_rpc(rpc_idx, record);
        Ok(())
    }

    /// Remove the RPC subscription keyed by `(xpath, priority)`.
    pub fn rpc_sub_remove(&mut self, rpc_idx: usize, xpath: &str, priority: u32) -> ShmResult<()> {
        let record = self.rpc(rpc_idx);
        let pos = self
            .ext
            .slice_at::<RpcSub>(record.subs.off, record.subs.count)
            .iter()
            .position(|sub| {
                sub.priority == priority && self.ext.cstr_at(sub.xpath) == xpath.as_bytes()
            })
            .ok_or_else(|| ShmError::NotFound {
                what: format!("RPC subscription ({xpath}, {priority})"),
            })?;
        self.rpc_sub_remove_at(rpc_idx, pos);
        Ok(())
    }

    fn rpc_sub_remove_at(&mut self, rpc_idx: usize, pos: usize) {
        let mut record = self.rpc(rpc_idx);
        let sub: RpcSub = self
            .ext
            .get(record.subs.off + pos as u64 * std::mem::size_of::<RpcSub>() as u64);
        self.ext.free_str(sub.xpath);
        record.subs = self.ext.swap_remove_entry::<RpcSub>(record.subs, pos as u64);
        self.write_rpc(rpc_idx, record);
    }

    /// Remove all subscriptions of one event pipe from the RPC at
    /// `rpc_idx`; returns how many were removed.
    pub(crate) fn rpc_sub_remove_by_evpipe(&mut self, rpc_idx: usize, evpipe: u32) -> usize {
        let mut removed = 0;
        loop {
            let record = self.rpc(rpc_idx);
            let pos = self
                .ext
                .slice_at::<RpcSub>(record.subs.off, record.subs.count)
                .iter()
                .position(|sub| sub.evpipe == evpipe);
            match pos {
                Some(pos) => {
                    self.rpc_sub_remove_at(rpc_idx, pos);
                    removed += 1;
                }
                None => return removed,
            }
        }
    }
}
