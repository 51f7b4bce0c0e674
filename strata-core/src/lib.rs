//! A didactic layered packet stack running between two cooperating
//! processes on one host.
//!
//! Each instance advertises itself by a symbolic identifier and exchanges
//! frames with a single named peer through a POSIX shared-memory mailbox
//! synchronized by a named counting semaphore. Inside an instance, four
//! layers are wired together over a small worker pool:
//!
//! - [`app`] — treats payloads as text and records what arrives
//! - [`udp`] — a fixed 8-byte datagram header
//! - [`ip`] — a checksummed 9-byte header with fragmentation on the way
//!   down and single-slot reassembly on the way up
//! - [`link`] — byte-stuffed, flag-delimited framing with an additive
//!   checksum
//!
//! The [`wire`] adapter below the data link owns the mailbox and the
//! semaphore and polls for arrivals.
//!
//! # Control flow
//!
//! Sends run synchronously down the caller's thread and end with a write
//! into the peer's mailbox. Receives flow upward one task per layer
//! transition: the poller enqueues a raw block, a worker destuffs it and
//! enqueues each packet, another worker reassembles and enqueues the
//! segment, and so on until the application logs the message. Every buffer
//! has a single owner; enqueueing transfers it to the worker that runs the
//! task.
//!
//! # Bring-up
//!
//! ```no_run
//! use strata_core::{Identity, Stack};
//!
//! # #[tokio::main(worker_threads = 4)]
//! # async fn main() {
//! let stack = Stack::start(Identity {
//!     source: "a".into(),
//!     destination: "b".into(),
//! })
//! .unwrap();
//! stack.send("hello", 12345, 54321).unwrap();
//! # }
//! ```

pub mod app;
mod checksum;
pub mod ip;
pub mod link;
pub mod shutdown;
mod stack;
mod tasks;
pub mod udp;
pub mod wire;

pub use checksum::Checksum;
pub use shutdown::{ExitStatus, Shutdown};
pub use stack::{Identity, InitError, SendError, Stack};
pub use tasks::Task;
pub use wire::{Wire, WireError, MAILBOX_OCTETS};
