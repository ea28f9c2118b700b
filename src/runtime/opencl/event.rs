//! Completion events and in-flight transfers.

use std::fmt;

use log::error;
use opencl3::event::Event as ClEvent;

use crate::error::{ClError, Result, Status};

const CL_COMPLETE: i32 = 0;

/// Completion event of an enqueued command.
pub struct Event {
    native: ClEvent,
}

impl Event {
    pub(crate) fn new(native: ClEvent) -> Self {
        Event { native }
    }

    /// Blocks until the command has completed.
    pub fn wait(&self) -> Result<()> {
        self.native.wait().map_err(|e| {
            let status = Status::from(e);
            error!("Error waiting for event: {}", status);
            ClError::WaitFailed(status)
        })
    }

    /// Returns true once the command has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        match self.native.command_execution_status() {
            Ok(status) => status.0 <= CL_COMPLETE,
            Err(_) => true,
        }
    }

    /// Returns the underlying OpenCL event.
    pub fn cl_event(&self) -> &ClEvent {
        &self.native
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").finish_non_exhaustive()
    }
}

// OpenCL handles thread safety internally
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

/// An enqueued transfer together with the host bytes it reads or fills.
///
/// The bytes stay owned here until the device is done with them. Dropping an
/// unfinished transfer blocks until it completes.
pub struct PendingTransfer {
    event: Option<Event>,
    data: Vec<u8>,
}

impl PendingTransfer {
    pub(crate) fn new(event: Event, data: Vec<u8>) -> Self {
        PendingTransfer {
            event: Some(event),
            data,
        }
    }

    /// Returns true once the transfer has finished.
    pub fn is_complete(&self) -> bool {
        self.event.as_ref().is_none_or(Event::is_complete)
    }

    /// Returns the completion event.
    pub fn event(&self) -> Option<&Event> {
        self.event.as_ref()
    }

    /// Number of bytes moved by this transfer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Waits for the transfer and hands back the host bytes.
    ///
    /// For a download these are the bytes read from the device; for an
    /// upload, the bytes that were written.
    pub fn wait(mut self) -> Result<Vec<u8>> {
        if let Some(event) = self.event.take() {
            event.wait()?;
        }
        Ok(std::mem::take(&mut self.data))
    }
}

impl Drop for PendingTransfer {
    fn drop(&mut self) {
        if let Some(event) = self.event.take() {
            if let Err(e) = event.wait() {
                error!("Transfer of {} bytes failed before drop: {}", self.data.len(), e);
            }
        }
    }
}

impl fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("len", &self.data.len())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Uploads issued with `blocking == false` whose staging copy is still in use.
#[derive(Default)]
pub(crate) struct StagedWrites {
    pending: Vec<PendingTransfer>,
}

impl StagedWrites {
    /// Tracks a new upload and drops the ones that have finished.
    pub(crate) fn push(&mut self, transfer: PendingTransfer) {
        self.pending.retain(|t| !t.is_complete());
        self.pending.push(transfer);
    }

    /// Waits for every tracked upload.
    pub(crate) fn wait_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for transfer in self.pending.drain(..) {
            if let Err(e) = transfer.wait() {
                result = Err(e);
            }
        }
        result
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
