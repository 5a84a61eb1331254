//! Singleton leadership over a distributed mutex.
//!
//! [`LockLifecycleManager`] resolves the lock configuration, joins the
//! coordination cluster through a [`warden_coordination::CoordinationBackend`],
//! and exposes `acquire`, `release` and `is_alive` to a host that must run as
//! exactly one active instance. The state machine behind those calls is
//! [`DistributedMutex`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod lifecycle;
mod mutex;

pub use error::Error;
pub use lifecycle::LockLifecycleManager;
pub use mutex::{DistributedMutex, MutexState};
pub use warden_config::LockConfiguration;
