//! davsync-vfs - Virtual-file strategies
//!
//! Two implementations of the [`Vfs`](davsync_core::ports::Vfs) port:
//!
//! - [`VfsOff`]: no virtual files; every remote file is downloaded
//! - [`SuffixVfs`]: remote-only files appear as zero-byte placeholders
//!   carrying a reserved suffix; hydration replaces the placeholder with
//!   the real file, dehydration goes the other way
//!
//! An OS-native strategy (platform placeholder APIs) would implement the
//! same port; the engine does not depend on one existing.

pub mod suffix;

pub use suffix::SuffixVfs;

use davsync_core::config::VfsMode;
use davsync_core::domain::pin::{Availability, PinState};
use davsync_core::domain::RelativePath;
use davsync_core::events::FileStatus;
use davsync_core::ports::{PlaceholderMetadata, Vfs};

/// The no-op strategy: everything is a plain local file.
pub struct VfsOff;

#[async_trait::async_trait]
impl Vfs for VfsOff {
    fn mode(&self) -> VfsMode {
        VfsMode::Off
    }

    async fn materialize_placeholder(
        &self,
        _path: &RelativePath,
        _metadata: &PlaceholderMetadata,
    ) -> anyhow::Result<()> {
        anyhow::bail!("virtual files are disabled for this root")
    }

    async fn hydrate(&self, _path: &RelativePath) -> anyhow::Result<()> {
        anyhow::bail!("virtual files are disabled for this root")
    }

    async fn dehydrate(&self, _path: &RelativePath) -> anyhow::Result<()> {
        anyhow::bail!("virtual files are disabled for this root")
    }

    async fn pin_state(&self, _path: &RelativePath) -> anyhow::Result<PinState> {
        Ok(PinState::Unspecified)
    }

    async fn set_pin_state(&self, _path: &RelativePath, _state: PinState) -> anyhow::Result<()> {
        anyhow::bail!("virtual files are disabled for this root")
    }

    async fn availability(&self, _path: &RelativePath) -> anyhow::Result<Availability> {
        Ok(Availability::AllHydrated)
    }

    fn is_placeholder(&self, _file_name: &str) -> bool {
        false
    }

    fn underlying_file_name(&self, file_name: &str) -> String {
        file_name.to_string()
    }

    fn placeholder_file_name(&self, file_name: &str) -> String {
        file_name.to_string()
    }

    async fn on_file_status_changed(&self, _path: &RelativePath, _status: FileStatus) {}
}
