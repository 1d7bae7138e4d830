//! Session-scoped handle table.
//!
//! Handle ids are opaque `u64`s issued by the engine, starting at 1 and
//! strictly increasing. An id is never reused within a session, even after
//! its handle is released, so a late request against a released handle can
//! always be distinguished from one against a recycled resource.
//!
//! Each entry owns the sending side of its handle's lane: an mpsc channel
//! feeding the worker task that executes this handle's operations one at a
//! time, in arrival order.

use crate::protocol::Request;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::mpsc;

/// Work item queued on a handle's lane
#[derive(Debug)]
pub struct LaneJob {
    pub request_id: u64,
    pub request: Request,
}

/// Whether a handle refers to an open file or an open directory stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

/// Table entry for one live handle
#[derive(Debug)]
pub struct HandleEntry {
    pub kind: HandleKind,
    /// Feeds the lane worker; dropping the last clone ends the worker
    pub lane: mpsc::Sender<LaneJob>,
    /// Set after an operation deadline expires; the handle only accepts
    /// release from then on
    pub degraded: Arc<AtomicBool>,
}

/// Bounded table of live handles for one session.
#[derive(Debug)]
pub struct HandleTable {
    entries: HashMap<u64, HandleEntry>,
    next_id: u64,
    max_open: usize,
}

impl HandleTable {
    pub fn new(max_open: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            max_open,
        }
    }

    /// Issue a fresh id for the entry, or fail if the table is full.
    pub fn allocate(&mut self, entry: HandleEntry) -> Result<u64> {
        if self.entries.len() >= self.max_open {
            return Err(Error::HandleExhausted(self.max_open));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, entry);
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<&HandleEntry> {
        self.entries.get(&id).ok_or(Error::HandleNotFound(id))
    }

    /// Remove an entry; the id stays burned.
    pub fn remove(&mut self, id: u64) -> Result<HandleEntry> {
        self.entries.remove(&id).ok_or(Error::HandleNotFound(id))
    }

    /// Take every remaining entry. Used at session teardown; dropping the
    /// returned entries closes all lanes.
    pub fn drain(&mut self) -> Vec<(u64, HandleEntry)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
