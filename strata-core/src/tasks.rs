//! The unit of work moved between layers on the receive path.
//!
//! Every upward layer transition crosses a task boundary: the producing
//! layer wraps the buffer in a [`Task`] and enqueues it, transferring
//! ownership to whichever worker runs the task. A failed enqueue drops the
//! buffer with the task value.

/// A buffer headed up the stack, tagged with the layer that should consume
/// it.
#[derive(Debug)]
pub enum Task {
    /// A raw mailbox block for the data link to scan for frames.
    DataLinkUp(Vec<u8>),
    /// A network PDU: the data-link protocol field followed by a packet.
    NetworkUp(Vec<u8>),
    /// A reassembled transport segment.
    TransportUp(Vec<u8>),
    /// An application payload.
    ApplicationUp(Vec<u8>),
}

/// The number of workers draining the task queue.
pub const WORKER_COUNT: usize = 4;

/// How many tasks may wait in the queue before enqueues start failing.
pub const QUEUE_DEPTH: usize = 64;
