//! Error taxonomy and the synchronous error-reporting sink.
//!
//! Corruption and double-frees are recovered locally (the offending block is
//! always reclaimed) and surfaced through [`ErrorSink::on_heap_error`] on the
//! thread that detected them. The manager itself never terminates the
//! process; the host decides whether to log, dump, or abort.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::StackId;

/// The kinds of heap errors surfaced through the sink.
///
/// Resource exhaustion is deliberately absent: a `None` return from
/// `allocate` is a normal, recoverable condition the caller must check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum HeapErrorKind {
    /// A block's metadata checksum failed validation.
    #[error("block checksum mismatch")]
    CorruptBlock,
    /// A block already in quarantine was freed a second time.
    #[error("block freed twice")]
    DoubleFree,
}

/// Details of a detected heap error, delivered synchronously to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapError {
    pub kind: HeapErrorKind,
    /// The body address of the faulting block.
    pub address: usize,
    /// Stack captured at the detection point. Zero if capture failed.
    pub crash_stack: StackId,
    /// Allocation-time stack of the block, if still trustworthy.
    pub alloc_stack: StackId,
    /// Free-time stack of the block, if any.
    pub free_stack: StackId,
    /// Thread that detected the error.
    pub thread_id: usize,
}

/// Receiver for heap error reports. Invoked synchronously on the detecting
/// thread, possibly while per-heap locks are held; implementations must not
/// call back into the manager. The report's stack ids are only guaranteed
/// valid for the duration of the callback; resolve them inside it.
pub trait ErrorSink: Send + Sync {
    fn on_heap_error(&self, error: &HeapError);
}

impl<F> ErrorSink for F
where
    F: Fn(&HeapError) + Send + Sync,
{
    fn on_heap_error(&self, error: &HeapError) {
        self(error)
    }
}

/// Default sink: forwards reports to the `log` facade.
pub struct LoggingSink;

impl ErrorSink for LoggingSink {
    fn on_heap_error(&self, error: &HeapError) {
        log::error!(
            "heap error: {} at {:#x} (thread {})",
            error.kind,
            error.address,
            error.thread_id
        );
    }
}
