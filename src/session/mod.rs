//! Live collaboration: one authoritative host, any number of clients.

pub mod client;
pub mod host;
pub mod locks;

use crate::edit::apply::AppliedBatch;
use crate::edit::change::BatchId;
use crate::error::{ConflictError, NetworkError};
use crate::net::transport::DEFAULT_MAX_FRAME;
use crate::world::region::Region;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::PoisonError;
use std::time::Duration;

pub use client::{ClientCore, ClientSession, ClientState};
pub use host::{HostCore, HostSession};
pub use locks::TileLocks;

pub type SessionId = u32;

/// Session id the host uses for its own edits.
pub const HOST_SESSION_ID: SessionId = 0;
pub const DEFAULT_PORT: u16 = 31313;

/// How long blocking reads wait before the session loops check their outbox and timers.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Name announced in `Hello`.
    pub name: String,
    pub ping_interval: Duration,
    pub timeout: Duration,
    pub max_frame: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            name: "mapedit".to_string(),
            ping_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// Notifications drained by the editor through `poll`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Host: a client finished its handshake.
    ClientJoined { session_id: SessionId, name: String },
    /// Host: a client connection ended and its locks were released.
    ClientLeft { session_id: SessionId, reason: String },
    /// Client: one of our own batches was acknowledged and applied locally.
    LocalApplied(AppliedBatch),
    /// A batch authored by another session was applied to our store.
    RemoteApplied {
        applied: AppliedBatch,
        originator: SessionId,
    },
    /// Client: the host refused one of our batches.
    Rejected {
        batch_id: BatchId,
        conflict: ConflictError,
    },
    /// Client: a region was replaced by a fresh snapshot from the host.
    Resynced { region: Region, revision: u64 },
    StateChanged(ClientState),
}

pub(crate) fn poisoned<T>(_: PoisonError<T>) -> NetworkError {
    NetworkError::lost("session state lock poisoned")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
enum SessionSignal {
    Running = 0,
    Shutdown = 1,
}

/// Stop flag shared by every thread of one session.
#[derive(Debug)]
pub(crate) struct SessionControl {
    signal: AtomicU8,
}

impl SessionControl {
    pub(crate) fn new() -> Self {
        Self {
            signal: AtomicU8::new(SessionSignal::Running as u8),
        }
    }

    /// Returns `false` when shutdown had already been requested.
    pub(crate) fn request_shutdown(&self) -> bool {
        self.signal.swap(SessionSignal::Shutdown as u8, Ordering::SeqCst) == SessionSignal::Running as u8
    }

    pub(crate) fn is_running(&self) -> bool {
        self.signal.load(Ordering::SeqCst) == SessionSignal::Running as u8
    }
}
