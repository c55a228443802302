//! Chunked blob upload driven by a caller supplied block source
//!
//! The coordinator pulls blocks from the caller one at a time. The data supply callback is
//! invoked with the outcome of the previous block and fills in the next one; an empty block
//! ends the stream, and the callback then sees one last call without a buffer that carries the
//! outcome of the whole upload. Block `n + 1` is never requested before the outcome of block
//! `n` has been delivered.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Instant;

use crate::registry::{ConfirmationResult, OperationId, OperationKind, PendingOperationRegistry};

/// Largest block the supply callback may hand over
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Largest number of blocks in a single upload
pub const MAX_BLOCK_COUNT: u32 = 50_000;

/// Outcome of a block or of a whole upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileUploadResult {
    /// Transferred
    Ok,
    /// Failed to transfer
    Error,
    /// Cancelled by the data supply callback
    Aborted,
}

/// Returned by the extended data supply callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetDataResult {
    /// Keep going with the block in the buffer, or finish if it is empty
    Ok,
    /// Stop the upload and cancel it remotely
    Abort,
}

/// Where the data supply callback puts the next block
#[derive(Debug, Default)]
pub struct BlockBuffer {
    data: Option<Vec<u8>>,
}

impl BlockBuffer {
    /// Provide the next block; leaving the buffer empty ends the stream
    pub fn set(&mut self, data: Vec<u8>) {
        self.data = Some(data);
    }

    fn take(&mut self) -> Option<Vec<u8>> {
        self.data.take().filter(|data| !data.is_empty())
    }
}

/// Data supply callback; `None` for the buffer marks the final call carrying the upload outcome
pub type GetDataCallback = Box<dyn FnMut(FileUploadResult, Option<&mut BlockBuffer>) + Send>;

/// Data supply callback that can abort the upload
pub type GetDataCallbackEx =
    Box<dyn FnMut(FileUploadResult, Option<&mut BlockBuffer>) -> GetDataResult + Send>;

/// Completion callback for single block uploads
pub type FileUploadCallback = Box<dyn FnOnce(FileUploadResult) + Send>;

/// Identifies an upload in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadSessionId(pub u64);

impl fmt::Display for UploadSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload#{}", self.0)
    }
}

/// How to finish an upload on the storage side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFinish {
    /// Commit the uploaded blocks and notify the hub
    Commit,
    /// Discard the uploaded blocks and notify the hub of the failure
    Cancel,
}

/// Something the blob transport has to tell the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobEvent {
    /// Storage for the upload is ready (or could not be obtained)
    Started {
        /// The upload
        session: UploadSessionId,
        /// Whether blocks can now be put
        result: FileUploadResult,
    },
    /// A block handed over with [`BlobTransport::put_block`] finished
    BlockCompleted {
        /// The block operation
        id: OperationId,
        /// How it finished
        result: ConfirmationResult,
    },
    /// A committed upload was finalised
    Finished {
        /// The upload
        session: UploadSessionId,
        /// Outcome of the whole upload
        result: FileUploadResult,
    },
}

/// Events collected from one [`BlobTransport::do_work`] call
#[derive(Debug, Default)]
pub struct BlobEvents {
    events: VecDeque<BlobEvent>,
}

impl BlobEvents {
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an event to the coordinator
    pub fn push(&mut self, event: BlobEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn pop(&mut self) -> Option<BlobEvent> {
        self.events.pop_front()
    }
}

/// Storage client that physically moves the bytes, independent of the telemetry transport
pub trait BlobTransport {
    /// Obtain storage for `destination`
    fn begin_upload(&mut self, session: UploadSessionId, destination: &str) -> crate::Result<()>;

    /// Queue one block
    fn put_block(
        &mut self,
        session: UploadSessionId,
        id: OperationId,
        block_number: u32,
        data: &[u8],
    ) -> crate::Result<()>;

    /// Commit or cancel the upload
    fn finish_upload(&mut self, session: UploadSessionId, finish: UploadFinish)
        -> crate::Result<()>;

    /// Process pending I/O without blocking and report what happened
    fn do_work(&mut self, events: &mut BlobEvents);
}

enum DataSupplier {
    Plain(GetDataCallback),
    Ex(GetDataCallbackEx),
}

impl DataSupplier {
    fn next_block(&mut self, previous: FileUploadResult, buffer: &mut BlockBuffer) -> GetDataResult {
        match self {
            DataSupplier::Plain(supply) => {
                supply(previous, Some(buffer));
                GetDataResult::Ok
            }
            DataSupplier::Ex(supply) => supply(previous, Some(buffer)),
        }
    }

    fn finish(mut self, result: FileUploadResult) {
        match &mut self {
            DataSupplier::Plain(supply) => supply(result, None),
            DataSupplier::Ex(supply) => {
                supply(result, None);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Starting { requested: bool },
    NeedData { previous: FileUploadResult },
    InFlight { id: OperationId },
    Committing,
}

struct UploadSession {
    destination: String,
    supplier: DataSupplier,
    state: SessionState,
    next_block: u32,
}

/// Drives every active upload of a client
pub(crate) struct UploadCoordinator {
    sessions: BTreeMap<UploadSessionId, UploadSession>,
    next_session: u64,
    finished: Vec<(DataSupplier, FileUploadResult)>,
}

impl fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("finished", &self.finished.len())
            .finish()
    }
}

impl UploadCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_session: 0,
            finished: Vec::new(),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn start(&mut self, destination: &str, supply: GetDataCallback) -> UploadSessionId {
        self.insert(destination, DataSupplier::Plain(supply))
    }

    pub(crate) fn start_ex(
        &mut self,
        destination: &str,
        supply: GetDataCallbackEx,
    ) -> UploadSessionId {
        self.insert(destination, DataSupplier::Ex(supply))
    }

    /// Single block upload: one block with the whole payload, then the end of the stream
    pub(crate) fn start_single(
        &mut self,
        destination: &str,
        data: Vec<u8>,
        on_complete: FileUploadCallback,
    ) -> UploadSessionId {
        let mut data = Some(data);
        let mut on_complete = Some(on_complete);
        self.start(
            destination,
            Box::new(move |result: FileUploadResult, buffer: Option<&mut BlockBuffer>| match buffer {
                Some(buffer) => {
                    if let Some(data) = data.take() {
                        buffer.set(data);
                    }
                }
                None => {
                    if let Some(on_complete) = on_complete.take() {
                        on_complete(result);
                    }
                }
            }),
        )
    }

    fn insert(&mut self, destination: &str, supplier: DataSupplier) -> UploadSessionId {
        let id = UploadSessionId(self.next_session);
        self.next_session += 1;
        info!("Starting {} to '{}'", id, destination);
        self.sessions.insert(
            id,
            UploadSession {
                destination: destination.to_string(),
                supplier,
                state: SessionState::Starting { requested: false },
                next_block: 0,
            },
        );
        id
    }

    /// Advance every session that can make progress without waiting on the transport
    pub(crate) fn pump<B, C>(
        &mut self,
        blob: &mut B,
        registry: &mut PendingOperationRegistry<C>,
        make_callback: impl Fn(UploadSessionId) -> C,
        now: Instant,
    ) where
        B: BlobTransport + ?Sized,
    {
        let ids: Vec<_> = self.sessions.keys().copied().collect();
        for id in ids {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let state = session.state;
            match state {
                SessionState::Starting { requested: false } => {
                    match blob.begin_upload(id, &session.destination) {
                        Ok(()) => session.state = SessionState::Starting { requested: true },
                        Err(e) => {
                            warn!("{} could not start: {}", id, e);
                            self.terminate(id, FileUploadResult::Error);
                        }
                    }
                }
                SessionState::NeedData { previous } => {
                    let mut buffer = BlockBuffer::default();
                    let answer = session.supplier.next_block(previous, &mut buffer);
                    match (answer, buffer.take()) {
                        (GetDataResult::Abort, _) => {
                            info!("{} aborted by the data supplier", id);
                            self.cancel_remote(blob, id, FileUploadResult::Aborted);
                        }
                        (GetDataResult::Ok, None) => {
                            debug!("{} end of stream after {} blocks", id, session.next_block);
                            match blob.finish_upload(id, UploadFinish::Commit) {
                                Ok(()) => session.state = SessionState::Committing,
                                Err(e) => {
                                    warn!("{} could not be committed: {}", id, e);
                                    self.terminate(id, FileUploadResult::Error);
                                }
                            }
                        }
                        (GetDataResult::Ok, Some(data)) => {
                            if data.len() > BLOCK_SIZE || session.next_block >= MAX_BLOCK_COUNT {
                                warn!(
                                    "{} block {} rejected ({} bytes)",
                                    id,
                                    session.next_block,
                                    data.len()
                                );
                                self.cancel_remote(blob, id, FileUploadResult::Error);
                                continue;
                            }
                            let op = match registry.register(
                                OperationKind::UploadBlock,
                                make_callback(id),
                                now,
                            ) {
                                Ok(op) => op,
                                Err(e) => {
                                    warn!("{} block could not be tracked: {}", id, e);
                                    self.cancel_remote(blob, id, FileUploadResult::Error);
                                    continue;
                                }
                            };
                            trace!("{} putting block {} as {}", id, session.next_block, op);
                            match blob.put_block(id, op, session.next_block, &data) {
                                Ok(()) => {
                                    if let Some(pending) = registry.get_mut(op) {
                                        pending.submitted = true;
                                    }
                                    session.next_block += 1;
                                    session.state = SessionState::InFlight { id: op };
                                }
                                Err(e) => {
                                    warn!("{} block {} rejected: {}", id, session.next_block, e);
                                    registry.complete(op);
                                    self.cancel_remote(blob, id, FileUploadResult::Error);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Storage became ready (or failed to)
    pub(crate) fn on_started(&mut self, id: UploadSessionId, result: FileUploadResult) {
        match self.sessions.get_mut(&id) {
            Some(session) if session.state == (SessionState::Starting { requested: true }) => {
                if result == FileUploadResult::Ok {
                    session.state = SessionState::NeedData {
                        previous: FileUploadResult::Ok,
                    };
                } else {
                    self.terminate(id, FileUploadResult::Error);
                }
            }
            _ => warn!("Ignoring start report for {}", id),
        }
    }

    /// The registry released a block operation
    pub(crate) fn on_block_completed<B>(
        &mut self,
        blob: &mut B,
        id: UploadSessionId,
        op: OperationId,
        result: ConfirmationResult,
    ) where
        B: BlobTransport + ?Sized,
    {
        match self.sessions.get_mut(&id) {
            Some(session) if session.state == (SessionState::InFlight { id: op }) => {
                if result == ConfirmationResult::Ok {
                    session.state = SessionState::NeedData {
                        previous: FileUploadResult::Ok,
                    };
                } else {
                    warn!("{} block {} failed: {:?}", id, op, result);
                    self.cancel_remote(blob, id, FileUploadResult::Error);
                }
            }
            _ => warn!("Ignoring block report {} for {}", op, id),
        }
    }

    /// A committed upload was finalised
    pub(crate) fn on_finished(&mut self, id: UploadSessionId, result: FileUploadResult) {
        match self.sessions.get(&id) {
            Some(session) if session.state == SessionState::Committing => {
                self.terminate(id, result)
            }
            _ => trace!("Ignoring finish report for {}", id),
        }
    }

    /// Stop every session, used when the client is destroyed
    pub(crate) fn cancel_all<B>(&mut self, blob: Option<&mut B>)
    where
        B: BlobTransport + ?Sized,
    {
        let ids: Vec<_> = self.sessions.keys().copied().collect();
        match blob {
            Some(blob) => {
                for id in ids {
                    self.cancel_remote(blob, id, FileUploadResult::Error);
                }
            }
            None => {
                for id in ids {
                    self.terminate(id, FileUploadResult::Error);
                }
            }
        }
    }

    /// Invoke the final callback of every upload that ended; returns how many ran
    pub(crate) fn dispatch_finished(&mut self) -> usize {
        let finished = std::mem::take(&mut self.finished);
        let count = finished.len();
        for (supplier, result) in finished {
            supplier.finish(result);
        }
        count
    }

    fn cancel_remote<B>(&mut self, blob: &mut B, id: UploadSessionId, result: FileUploadResult)
    where
        B: BlobTransport + ?Sized,
    {
        if let Err(e) = blob.finish_upload(id, UploadFinish::Cancel) {
            debug!("{} cancel not delivered: {}", id, e);
        }
        self.terminate(id, result);
    }

    fn terminate(&mut self, id: UploadSessionId, result: FileUploadResult) {
        if let Some(session) = self.sessions.remove(&id) {
            info!(
                "{} to '{}' finished: {:?}",
                id, session.destination, result
            );
            self.finished.push((session.supplier, result));
        }
    }
}
