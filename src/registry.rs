//! Registry of outstanding asynchronous operations
//!
//! Every event send, reported state update, method response and upload block lives here from
//! the moment it is accepted until its callback has been handed back for invocation. Entries
//! sit in an arena of generation-checked slots, so a stale or repeated completion can never
//! reach a slot that has since been reused by another operation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use crate::error::IoTHubError;

/// Default number of operations that may be outstanding at once
pub const DEFAULT_MAX_PENDING_OPERATIONS: usize = 4096;

/// Identifies an outstanding operation
///
/// Sequence numbers increase monotonically across the client's lifetime and give the
/// registration order; the slot index and generation locate the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId {
    index: u32,
    generation: u32,
    sequence: u64,
}

impl OperationId {
    /// Registration order of the operation
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.sequence)
    }
}

/// Kind of outstanding operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Device to cloud telemetry event
    SendEvent,
    /// Device twin reported properties patch
    ReportedStateUpdate,
    /// Answer to a cloud invoked device method
    MethodResponse,
    /// One block of a blob upload
    UploadBlock,
}

/// Outcome delivered to the callback of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmationResult {
    /// The hub acknowledged the operation
    Ok,
    /// The transport reported a failure
    Error,
    /// The transport gave up waiting for an acknowledgement
    MessageTimeout,
    /// The client was destroyed while the operation was outstanding
    BecauseDestroy,
}

/// An entry in the registry
#[derive(Debug)]
pub(crate) struct PendingOperation<C> {
    pub(crate) id: OperationId,
    pub(crate) kind: OperationKind,
    pub(crate) callback: C,
    pub(crate) created_at: Instant,
    /// Handed to the transport; otherwise held until the connection is up
    pub(crate) submitted: bool,
}

#[derive(Debug)]
struct Slot<C> {
    generation: u32,
    entry: Option<PendingOperation<C>>,
}

#[derive(Debug)]
pub(crate) struct PendingOperationRegistry<C> {
    slots: Vec<Slot<C>>,
    free: Vec<u32>,
    capacity: usize,
    next_sequence: u64,
    len: usize,
}

impl<C> PendingOperationRegistry<C> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            next_sequence: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub(crate) fn count(&self, kind: OperationKind) -> usize {
        self.iter().filter(|op| op.kind == kind).count()
    }

    /// Track a new operation
    pub(crate) fn register(
        &mut self,
        kind: OperationKind,
        callback: C,
        now: Instant,
    ) -> crate::Result<OperationId> {
        if self.len >= self.capacity {
            return Err(IoTHubError::OutOfMemory(format!(
                "{} operations already outstanding",
                self.len
            )));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    IoTHubError::OutOfMemory("operation arena exhausted".to_string())
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = OperationId {
            index,
            generation: slot.generation,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        slot.entry = Some(PendingOperation {
            id,
            kind,
            callback,
            created_at: now,
            submitted: false,
        });
        self.len += 1;

        trace!("Registered {:?} as {}", kind, id);
        Ok(id)
    }

    pub(crate) fn get_mut(&mut self, id: OperationId) -> Option<&mut PendingOperation<C>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .filter(|op| op.id == id)
    }

    /// Remove a finished operation and hand it back so its callback can run once the caller
    /// has released its own state
    ///
    /// Completing an id that is not outstanding breaks the exactly-once contract. Debug builds
    /// assert; release builds log and ignore the report.
    pub(crate) fn complete(&mut self, id: OperationId) -> Option<PendingOperation<C>> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.entry.is_some());

        let Some(slot) = slot else {
            error!("{} completed twice or never registered", id);
            debug_assert!(false, "{} completed twice or never registered", id);
            return None;
        };

        let op = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        trace!("Completed {}", id);
        op
    }

    /// Operations not yet handed to the transport, oldest first
    pub(crate) fn held(&self) -> Vec<OperationId> {
        let mut held: Vec<_> = self
            .iter()
            .filter(|op| !op.submitted)
            .map(|op| op.id)
            .collect();
        held.sort_by_key(OperationId::sequence);
        held
    }

    /// Remove every remaining operation, oldest first
    pub(crate) fn cancel_all(&mut self) -> Vec<PendingOperation<C>> {
        let mut drained: Vec<_> = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                let op = slot.entry.take()?;
                slot.generation = slot.generation.wrapping_add(1);
                Some(op)
            })
            .collect();
        drained.sort_by_key(|op| op.id.sequence);

        self.free = (0..self.slots.len() as u32).rev().collect();
        self.len = 0;
        debug!("Cancelled {} outstanding operations", drained.len());
        drained
    }

    fn iter(&self) -> impl Iterator<Item = &PendingOperation<C>> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }
}
