use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod staging;
pub use staging::StagingDirectoryUpdater;

/// Stages and applies new versions on behalf of the swarm.
///
/// The swarm decides whether and when an update happens; the applier only
/// stages packages and acts on the decision.
#[async_trait]
pub trait UpdateApplier: Send + Sync {
    /// Stage `package` as `version` without applying it.
    async fn begin_update(&self, version: &str, package: Bytes) -> Result<()>;

    /// Apply the staged `version`. Called once every member has prepared.
    async fn apply_update(&self, version: &str) -> Result<()>;

    /// Throw away the staged `version`.
    async fn discard_update(&self, version: &str) -> Result<()>;
}
