//! The wire between two stack instances: a fixed-size shared-memory mailbox
//! per instance plus a named counting semaphore the sender posts after
//! writing.
//!
//! The mailbox is a single slot, not a queue. A sender that posts twice
//! before the receiver consumes silently overwrites the first block, so
//! delivery is best-effort with no duplicate suppression.

use crate::shutdown::Shutdown;
use crate::tasks::Task;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;

/// The size of every instance's mailbox in bytes.
pub const MAILBOX_OCTETS: usize = 2048;

/// How long the poller sleeps when the mailbox is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const MAILBOX_LEN: NonZeroUsize = match NonZeroUsize::new(MAILBOX_OCTETS) {
    Some(len) => len,
    None => unreachable!(),
};

#[derive(Debug, ThisError)]
pub enum WireError {
    #[error("cannot send to self")]
    SelfSend,
    #[error("frame of {0} bytes exceeds the {MAILBOX_OCTETS} byte mailbox")]
    OversizedFrame(usize),
    #[error("peer {0} is not reachable: {1}")]
    PeerUnavailable(String, Errno),
    #[error("instance identifier {0:?} is not usable as a mailbox name")]
    BadIdentifier(String),
    #[error("mailbox setup failed: {0}")]
    Setup(Errno),
    #[error("could not spawn the mailbox poller: {0}")]
    Poller(std::io::Error),
}

/// The raw handles the poller thread needs from the local endpoint.
struct PollerHandles {
    map: *const u8,
    sem: *mut libc::sem_t,
}

// The mapping and semaphore outlive the poller: shutdown joins the thread
// before releasing either.
unsafe impl Send for PollerHandles {}

/// One instance's end of the wire.
///
/// Owns the local inbox (mailbox plus semaphore) and the poller thread that
/// drains it. Peer handles are opened fresh for every send and closed before
/// it returns.
pub struct Wire {
    source: String,
    destination: String,
    map: *mut u8,
    shm_fd: RawFd,
    sem: *mut libc::sem_t,
    shm_name: CString,
    sem_name: CString,
    shutdown: Shutdown,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
    torn_down: AtomicBool,
}

// Raw handles are only touched from `send`, the poller, and teardown, which
// serializes against the poller by joining it first.
unsafe impl Send for Wire {}
unsafe impl Sync for Wire {}

impl Wire {
    /// Creates the local inbox and starts the poller.
    ///
    /// Any stale mailbox or semaphore left over from a previous run under
    /// the same name is unlinked first. Arriving blocks are enqueued as
    /// [`Task::DataLinkUp`] on `tasks`.
    pub fn new(
        source: &str,
        destination: &str,
        tasks: mpsc::Sender<Task>,
    ) -> Result<Self, WireError> {
        let shm_name = mailbox_name(source)?;
        let sem_name = semaphore_name(source)?;

        // Stale objects from a crashed prior instance are not an error.
        let _ = shm_unlink(shm_name.as_c_str());
        unsafe { libc::sem_unlink(sem_name.as_ptr()) };

        let shm_fd = shm_open(
            shm_name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(WireError::Setup)?;

        if let Err(errno) = ftruncate(shm_fd, MAILBOX_OCTETS as libc::off_t) {
            let _ = close(shm_fd);
            let _ = shm_unlink(shm_name.as_c_str());
            return Err(WireError::Setup(errno));
        }

        let map = match unsafe {
            mmap(
                None,
                MAILBOX_LEN,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                shm_fd,
                0,
            )
        } {
            Ok(map) => map as *mut u8,
            Err(errno) => {
                let _ = close(shm_fd);
                let _ = shm_unlink(shm_name.as_c_str());
                return Err(WireError::Setup(errno));
            }
        };
        unsafe { ptr::write_bytes(map, 0, MAILBOX_OCTETS) };

        let sem = unsafe {
            libc::sem_open(
                sem_name.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let errno = Errno::last();
            unsafe {
                let _ = munmap(map as *mut _, MAILBOX_OCTETS);
            }
            let _ = close(shm_fd);
            let _ = shm_unlink(shm_name.as_c_str());
            return Err(WireError::Setup(errno));
        }

        let shutdown = Shutdown::new();
        let handles = PollerHandles {
            map: map as *const u8,
            sem,
        };
        let poller = {
            let tasks = tasks.clone();
            let shutdown = shutdown.clone();
            let source = source.to_owned();
            thread::Builder::new()
                .name(format!("wire-poller-{source}"))
                .spawn(move || poll_loop(handles, source, tasks, shutdown))
        };
        let poller = match poller {
            Ok(handle) => handle,
            Err(error) => {
                shutdown.shut_down();
                unsafe {
                    libc::sem_close(sem);
                    libc::sem_unlink(sem_name.as_ptr());
                    let _ = munmap(map as *mut _, MAILBOX_OCTETS);
                }
                let _ = close(shm_fd);
                let _ = shm_unlink(shm_name.as_c_str());
                return Err(WireError::Poller(error));
            }
        };

        tracing::debug!(source, destination, "wire initialized");
        Ok(Self {
            source: source.to_owned(),
            destination: destination.to_owned(),
            map,
            shm_fd,
            sem,
            shm_name,
            sem_name,
            shutdown,
            poller: Mutex::new(Some(poller)),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Writes a frame into the peer's mailbox and posts the peer's
    /// semaphore. Best-effort: a missing peer is an error, not a retry.
    pub fn send(&self, frame: &[u8]) -> Result<(), WireError> {
        if self.source == self.destination {
            return Err(WireError::SelfSend);
        }
        if frame.len() > MAILBOX_OCTETS {
            return Err(WireError::OversizedFrame(frame.len()));
        }

        let peer_sem_name = semaphore_name(&self.destination)?;
        let peer_shm_name = mailbox_name(&self.destination)?;

        let peer_sem = unsafe { libc::sem_open(peer_sem_name.as_ptr(), 0) };
        if peer_sem == libc::SEM_FAILED {
            return Err(WireError::PeerUnavailable(
                self.destination.clone(),
                Errno::last(),
            ));
        }

        let outcome = (|| -> Result<(), WireError> {
            let peer_fd = shm_open(peer_shm_name.as_c_str(), OFlag::O_RDWR, Mode::empty())
                .map_err(|errno| WireError::PeerUnavailable(self.destination.clone(), errno))?;

            let peer_map = match unsafe {
                mmap(
                    None,
                    MAILBOX_LEN,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    peer_fd,
                    0,
                )
            } {
                Ok(map) => map,
                Err(errno) => {
                    let _ = close(peer_fd);
                    return Err(WireError::Setup(errno));
                }
            };

            unsafe {
                ptr::copy_nonoverlapping(frame.as_ptr(), peer_map as *mut u8, frame.len());
            }
            let posted = unsafe { libc::sem_post(peer_sem) };

            unsafe {
                let _ = munmap(peer_map, MAILBOX_OCTETS);
            }
            let _ = close(peer_fd);

            if posted != 0 {
                return Err(WireError::Setup(Errno::last()));
            }
            tracing::debug!(
                destination = %self.destination,
                len = frame.len(),
                "frame written to peer mailbox"
            );
            Ok(())
        })();

        unsafe { libc::sem_close(peer_sem) };
        outcome
    }

    /// Stops the poller and releases the local inbox. Idempotent.
    pub fn shut_down(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.shut_down();
        if let Some(handle) = self.poller.lock().unwrap().take() {
            let _ = handle.join();
        }
        unsafe {
            libc::sem_close(self.sem);
            libc::sem_unlink(self.sem_name.as_ptr());
            let _ = munmap(self.map as *mut _, MAILBOX_OCTETS);
        }
        let _ = close(self.shm_fd);
        let _ = shm_unlink(self.shm_name.as_c_str());
        tracing::debug!(source = %self.source, "wire shut down");
    }
}

impl Drop for Wire {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

/// The poller: drains the local semaphore, copying the whole mailbox upward
/// for each post, sleeping between empty polls.
fn poll_loop(handles: PollerHandles, source: String, tasks: mpsc::Sender<Task>, shutdown: Shutdown) {
    while !shutdown.is_shut_down() {
        let result = unsafe { libc::sem_trywait(handles.sem) };
        if result == 0 {
            let mut block = vec![0u8; MAILBOX_OCTETS];
            unsafe {
                ptr::copy_nonoverlapping(handles.map, block.as_mut_ptr(), MAILBOX_OCTETS);
            }
            if let Err(error) = tasks.try_send(Task::DataLinkUp(block)) {
                tracing::error!(source = %source, %error, "dropping inbound block");
            }
        } else {
            match Errno::last() {
                Errno::EAGAIN => thread::sleep(POLL_INTERVAL),
                Errno::EINTR => {}
                errno => {
                    tracing::error!(source = %source, %errno, "mailbox wait failed, poller exiting");
                    break;
                }
            }
        }
    }
    tracing::debug!(source = %source, "poller exiting");
}

fn mailbox_name(id: &str) -> Result<CString, WireError> {
    CString::new(id).map_err(|_| WireError::BadIdentifier(id.to_owned()))
}

fn semaphore_name(id: &str) -> Result<CString, WireError> {
    CString::new(format!("/sem_{id}")).map_err(|_| WireError::BadIdentifier(id.to_owned()))
}
