//! Reqid allocation.
//!
//! A reqid links policy templates to SAs. CHILD_SAs with identical
//! selectors, marks and interface IDs share one reqid, so lookups are keyed
//! by [`ReqidKey`] and every allocation is reference counted.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::error::{Error, Result};
use super::types::{Mark, TrafficSelector};

/// What makes two reqid requests equivalent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ReqidKey {
    /// Traffic selectors covered by the SA pair.
    pub selectors: Vec<TrafficSelector>,
    /// Inbound mark.
    pub mark_in: Option<Mark>,
    /// Outbound mark.
    pub mark_out: Option<Mark>,
    /// Inbound XFRM interface ID.
    pub if_id_in: Option<u32>,
    /// Outbound XFRM interface ID.
    pub if_id_out: Option<u32>,
}

impl ReqidKey {
    /// Key covering the given selectors.
    pub fn new(selectors: Vec<TrafficSelector>) -> Self {
        Self {
            selectors,
            ..Self::default()
        }
    }

    /// Set inbound and outbound marks.
    pub fn marks(mut self, mark_in: Mark, mark_out: Mark) -> Self {
        self.mark_in = Some(mark_in);
        self.mark_out = Some(mark_out);
        self
    }

    /// Set inbound and outbound interface IDs.
    pub fn if_ids(mut self, if_id_in: u32, if_id_out: u32) -> Self {
        self.if_id_in = Some(if_id_in);
        self.if_id_out = Some(if_id_out);
        self
    }
}

struct Entry {
    key: ReqidKey,
    refs: u32,
}

struct State {
    next: u32,
    by_key: HashMap<ReqidKey, u32>,
    entries: HashMap<u32, Entry>,
}

pub(crate) struct ReqidAllocator {
    state: Mutex<State>,
}

impl ReqidAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next: 1,
                by_key: HashMap::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Get the reqid for `key`, allocating one on first use.
    pub fn alloc(&self, key: ReqidKey) -> Result<u32> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let existing = state.by_key.get(&key).copied();
        if let Some(reqid) = existing {
            if let Some(entry) = state.entries.get_mut(&reqid) {
                entry.refs += 1;
            }
            return Ok(reqid);
        }

        if state.entries.len() >= (u32::MAX - 1) as usize {
            return Err(Error::rejected("alloc_reqid", "reqid space exhausted"));
        }

        // 0 means "no reqid" to the kernel
        let mut reqid = state.next;
        while reqid == 0 || state.entries.contains_key(&reqid) {
            reqid = reqid.wrapping_add(1);
        }
        state.next = reqid.wrapping_add(1);

        state.by_key.insert(key.clone(), reqid);
        state.entries.insert(reqid, Entry { key, refs: 1 });
        Ok(reqid)
    }

    /// Drop one reference. The reqid becomes reusable at zero.
    pub fn release(&self, reqid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = state
            .entries
            .get_mut(&reqid)
            .ok_or_else(|| Error::NotFound(format!("reqid {}", reqid)))?;
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = state.entries.remove(&reqid) {
                state.by_key.remove(&entry.key);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn refs(&self, reqid: u32) -> Option<u32> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(&reqid).map(|e| e.refs)
    }
}
