pub mod client_state;
pub mod config;
pub mod connection;
pub mod console;
pub mod registry;
pub mod scheduler;
pub mod token_store;
pub mod transport;

use std::{
    sync::{Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub use bridgedeck_core::{
    ApiError, ConnectionState, Credential, EventKind, InstanceId, SessionScope, StatusSnapshot,
};
pub use client_state::{ClientStateStore, PersistedClientState};
pub use config::{ConfigError, ConsoleConfig};
pub use connection::PairingArtifact;
pub use console::{Console, ConsoleEvent, NewInstance, NoticeLevel};
pub use registry::Instance;

pub(crate) fn now_unix_ms() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Lock a std mutex, recovering the data if a holder panicked. Guards are
/// never held across an await.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
