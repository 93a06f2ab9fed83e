//! Virtual-file strategy port
//!
//! A VFS strategy changes what "present locally" means: remote-only files
//! can exist as placeholders that hydrate on demand. The engine talks to
//! the strategy through this trait; the suffix strategy is mandatory, an
//! OS-native strategy may implement the same surface.

use chrono::{DateTime, Utc};

use crate::config::VfsMode;
use crate::domain::newtypes::{Etag, FileId, RelativePath};
use crate::domain::pin::{Availability, PinState};
use crate::events::FileStatus;

/// Metadata a placeholder carries without any content.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderMetadata {
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub etag: Option<Etag>,
    pub file_id: Option<FileId>,
}

/// Port trait for virtual-file strategies.
#[async_trait::async_trait]
pub trait Vfs: Send + Sync {
    fn mode(&self) -> VfsMode;

    /// Creates or rewrites the placeholder for a remote-only file.
    async fn materialize_placeholder(
        &self,
        path: &RelativePath,
        metadata: &PlaceholderMetadata,
    ) -> anyhow::Result<()>;

    /// Requests hydration of a placeholder. The engine services the
    /// request as a user-visible (priority) download job.
    async fn hydrate(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Replaces a hydrated file with its placeholder again.
    async fn dehydrate(&self, path: &RelativePath) -> anyhow::Result<()>;

    async fn pin_state(&self, path: &RelativePath) -> anyhow::Result<PinState>;

    async fn set_pin_state(&self, path: &RelativePath, state: PinState) -> anyhow::Result<()>;

    /// Folds the hydration state of `path` and its descendants.
    async fn availability(&self, path: &RelativePath) -> anyhow::Result<Availability>;

    /// Whether an on-disk name denotes a placeholder.
    fn is_placeholder(&self, file_name: &str) -> bool;

    /// Strips the placeholder decoration from an on-disk name.
    fn underlying_file_name(&self, file_name: &str) -> String;

    /// Adds the placeholder decoration to a plain name.
    fn placeholder_file_name(&self, file_name: &str) -> String;

    /// Status feedback for overlay providers.
    async fn on_file_status_changed(&self, path: &RelativePath, status: FileStatus);
}
