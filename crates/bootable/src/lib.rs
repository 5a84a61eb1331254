//! Abstract interface for services with an explicit start/shutdown lifecycle.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;

use async_trait::async_trait;

/// A long-lived participant that is started once and torn down once.
///
/// Shutdown must be idempotent: calling it on a service that was never started,
/// or that has already been shut down, succeeds without doing anything.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// The error returned when starting or shutting down fails.
    type Error: Error + Send + Sync + 'static;

    /// Name used in log events about this service.
    fn bootable_name(&self) -> &str;

    /// Start the service.
    async fn start(&self) -> Result<(), Self::Error>;

    /// Shut the service down.
    async fn shutdown(&self) -> Result<(), Self::Error>;

    /// Wait until the service is no longer running.
    async fn wait(&self);
}
