//! Abstract interface for the distributed coordination service backing the lock.
//!
//! A [`CoordinationBackend`] builds the two roles a process plays in the cluster:
//! a server role (hosting or joining coordination state) and a client role
//! (connecting to it). The client role hands out [`MutexPrimitive`]s: named,
//! cluster-visible locks tied to the client's session.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod participant;

pub use error::{Error, Role};
pub use participant::CoordinationParticipant;

use std::error::Error as StdError;
use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use warden_bootable::Bootable;

/// Marker trait for coordination backend errors.
pub trait CoordinationError: Debug + StdError + Send + Sync + 'static {
    /// Whether the failure was caused by the contents of a role config file
    /// rather than by the cluster itself.
    fn is_config(&self) -> bool {
        false
    }
}

/// The coordination service's current ownership record for a named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// The lock is held by another session, identified by the String.
    HeldByOther(String),

    /// The lock is held by the calling session.
    HeldBySelf,
}

/// How a role locates the coordination cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleConfig {
    /// Environment-default discovery; no config file.
    Discovery,

    /// Settings from a config file.
    File {
        /// Where the file was read from.
        path: PathBuf,

        /// The file's contents.
        contents: String,
    },
}

/// A named mutual-exclusion primitive in the coordination cluster.
///
/// Ownership is attributed to the client session that created the handle. The
/// handle holds no belief of its own: every call goes to the service.
#[async_trait]
pub trait MutexPrimitive: Send + Sync + 'static {
    /// The error type for mutex operations.
    type Error: CoordinationError;

    /// The name of the lock in the cluster.
    fn name(&self) -> &str;

    /// Attempts to claim the lock without waiting.
    ///
    /// Returns `Ok(false)` when the lock is held by someone else. The result is
    /// advisory; the holder record from [`Self::status`] is authoritative.
    async fn try_claim(&self) -> Result<bool, Self::Error>;

    /// Queries the current holder of the lock.
    async fn status(&self) -> Result<LockStatus, Self::Error>;

    /// Releases the lock if, and only if, it is held by this session.
    async fn release(&self) -> Result<(), Self::Error>;
}

/// The client role: a session in the coordination cluster.
#[async_trait]
pub trait CoordinationClient: Bootable {
    /// The mutex primitive handed out by this client.
    type Mutex: MutexPrimitive<Error = Self::Error>;

    /// Identifier the cluster attributes this session's ownership to.
    fn session_id(&self) -> &str;

    /// Obtains a handle to the named lock.
    ///
    /// Fails if the client is not connected. The handle stops working once the
    /// client is shut down.
    async fn mutex(&self, name: &str) -> Result<Self::Mutex, Self::Error>;
}

/// Builds the server and client roles for one process.
pub trait CoordinationBackend: Send + Sync + 'static {
    /// The error type shared by both roles and the mutex.
    type Error: CoordinationError;

    /// The server role.
    type Server: Bootable<Error = Self::Error>;

    /// The client role.
    type Client: CoordinationClient<Error = Self::Error>;

    /// Creates an unstarted server role.
    ///
    /// # Errors
    ///
    /// Returns an error if the role configuration is rejected.
    fn server(&self, config: RoleConfig) -> Result<Self::Server, Self::Error>;

    /// Creates an unstarted client role.
    ///
    /// # Errors
    ///
    /// Returns an error if the role configuration is rejected.
    fn client(&self, config: RoleConfig) -> Result<Self::Client, Self::Error>;
}
