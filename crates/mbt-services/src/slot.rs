//! DFU slot catalog: firmware images available for distribution.
//!
//! A slot is reserved, filled in with `set_info`/`set_fwid`, then committed.
//! Only committed slots are visible to lookups and persisted. Callers must
//! not modify the same slot from two places at once.

use std::ops::ControlFlow;

use mbt_core::config::DfuConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("all slots in use")]
    Full,
    #[error("no such slot")]
    NotFound,
    #[error("{0} too long")]
    TooLong(&'static str),
    #[error("slot is committed")]
    Committed,
    #[error("slot is incomplete: {0}")]
    Incomplete(&'static str),
    #[error("a slot with this firmware id exists")]
    Exists,
    #[error("slot store: {0}")]
    Store(String),
}

/// One distributable image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfuSlot {
    pub size: u32,
    #[serde(with = "hex_bytes")]
    pub fwid: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle(u32);

#[derive(Debug)]
struct Entry {
    handle: SlotHandle,
    committed: bool,
    slot: DfuSlot,
}

pub struct SlotStore {
    cfg: DfuConfig,
    entries: Vec<Entry>,
    next_handle: u32,
    store: Box<dyn StateStore<Vec<DfuSlot>>>,
}

impl SlotStore {
    /// Open the catalog, loading committed slots from `store`.
    pub fn open(cfg: DfuConfig, mut store: Box<dyn StateStore<Vec<DfuSlot>>>) -> Result<Self, SlotError> {
        let slots = store.load().map_err(|e| SlotError::Store(e.to_string()))?.unwrap_or_default();
        let mut catalog = Self { cfg, entries: Vec::new(), next_handle: 0, store };
        for slot in slots.into_iter().take(catalog.cfg.slot_max) {
            let handle = catalog.alloc_handle();
            catalog.entries.push(Entry { handle, committed: true, slot });
        }
        debug!(slots = catalog.entries.len(), "slot catalog loaded");
        Ok(catalog)
    }

    fn alloc_handle(&mut self) -> SlotHandle {
        let handle = SlotHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    fn entry(&self, handle: SlotHandle) -> Result<&Entry, SlotError> {
        self.entries.iter().find(|e| e.handle == handle).ok_or(SlotError::NotFound)
    }

    fn entry_mut(&mut self, handle: SlotHandle) -> Result<&mut Entry, SlotError> {
        self.entries.iter_mut().find(|e| e.handle == handle).ok_or(SlotError::NotFound)
    }

    fn uncommitted_mut(&mut self, handle: SlotHandle) -> Result<&mut Entry, SlotError> {
        let entry = self.entry_mut(handle)?;
        if entry.committed {
            return Err(SlotError::Committed);
        }
        Ok(entry)
    }

    fn persist(&mut self) -> Result<(), SlotError> {
        let slots: Vec<DfuSlot> = self
            .entries
            .iter()
            .filter(|e| e.committed)
            .map(|e| e.slot.clone())
            .collect();
        self.store.save(&slots).map_err(|e| SlotError::Store(e.to_string()))
    }

    pub fn reserve(&mut self) -> Result<SlotHandle, SlotError> {
        if self.entries.len() >= self.cfg.slot_max {
            warn!(max = self.cfg.slot_max, "no free DFU slot");
            return Err(SlotError::Full);
        }
        let handle = self.alloc_handle();
        self.entries.push(Entry { handle, committed: false, slot: DfuSlot::default() });
        Ok(handle)
    }

    pub fn set_info(&mut self, handle: SlotHandle, size: u32, metadata: &[u8]) -> Result<(), SlotError> {
        if metadata.len() > self.cfg.metadata_max {
            return Err(SlotError::TooLong("metadata"));
        }
        let entry = self.uncommitted_mut(handle)?;
        entry.slot.size = size;
        entry.slot.metadata = metadata.to_vec();
        Ok(())
    }

    pub fn set_fwid(&mut self, handle: SlotHandle, fwid: &[u8]) -> Result<(), SlotError> {
        if fwid.len() > self.cfg.fwid_max {
            return Err(SlotError::TooLong("firmware id"));
        }
        self.uncommitted_mut(handle)?.slot.fwid = fwid.to_vec();
        Ok(())
    }

    /// Make a filled-in slot visible and persist it.
    pub fn commit(&mut self, handle: SlotHandle) -> Result<(), SlotError> {
        let entry = self.entry(handle)?;
        if entry.committed {
            return Err(SlotError::Committed);
        }
        if entry.slot.fwid.is_empty() {
            return Err(SlotError::Incomplete("firmware id"));
        }
        if entry.slot.size == 0 {
            return Err(SlotError::Incomplete("size"));
        }
        if self.get_by_fwid(&entry.slot.fwid).is_some() {
            return Err(SlotError::Exists);
        }

        self.entry_mut(handle)?.committed = true;
        if let Err(e) = self.persist() {
            self.entry_mut(handle)?.committed = false;
            return Err(e);
        }
        info!(fwid = %hex::encode(&self.entry(handle)?.slot.fwid), "DFU slot committed");
        Ok(())
    }

    /// Drop a reserved slot that was never committed.
    pub fn release(&mut self, handle: SlotHandle) -> Result<(), SlotError> {
        if self.entry(handle)?.committed {
            return Err(SlotError::Committed);
        }
        self.entries.retain(|e| e.handle != handle);
        Ok(())
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&DfuSlot> {
        self.entry(handle).ok().filter(|e| e.committed).map(|e| &e.slot)
    }

    pub fn get_by_fwid(&self, fwid: &[u8]) -> Option<SlotHandle> {
        self.entries
            .iter()
            .find(|e| e.committed && e.slot.fwid == fwid)
            .map(|e| e.handle)
    }

    /// The committed slot at position `idx`, in commit order.
    pub fn at(&self, idx: usize) -> Option<SlotHandle> {
        self.entries.iter().filter(|e| e.committed).nth(idx).map(|e| e.handle)
    }

    pub fn delete(&mut self, handle: SlotHandle) -> Result<(), SlotError> {
        let committed = self.entry(handle)?.committed;
        self.entries.retain(|e| e.handle != handle);
        if committed {
            self.persist()?;
        }
        Ok(())
    }

    pub fn delete_all(&mut self) -> Result<(), SlotError> {
        self.entries.retain(|e| !e.committed);
        self.store.erase().map_err(|e| SlotError::Store(e.to_string()))
    }

    /// Visit committed slots until `f` breaks. Returns how many were visited.
    pub fn foreach<F>(&self, mut f: F) -> usize
    where
        F: FnMut(SlotHandle, &DfuSlot) -> ControlFlow<()>,
    {
        let mut visited = 0;
        for e in self.entries.iter().filter(|e| e.committed) {
            visited += 1;
            if f(e.handle, &e.slot).is_break() {
                break;
            }
        }
        visited
    }

    /// Number of committed slots.
    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| e.committed).count()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
