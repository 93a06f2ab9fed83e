//! Suffix-placeholder strategy
//!
//! Remote-only files exist locally as zero-byte files named
//! `<name>.davsyncfile`. Hydration requests are forwarded to the folder
//! loop, which services them as priority download jobs; pin states
//! persist in the journal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use davsync_core::config::VfsMode;
use davsync_core::domain::pin::{Availability, PinState};
use davsync_core::domain::{ItemKind, RelativePath};
use davsync_core::events::FileStatus;
use davsync_core::ports::{PlaceholderMetadata, Vfs};
use davsync_journal::SyncJournal;

/// Suffix that marks a dehydrated file on disk.
pub const PLACEHOLDER_SUFFIX: &str = ".davsyncfile";

/// The suffix-placeholder strategy for one root.
pub struct SuffixVfs {
    root: PathBuf,
    journal: Arc<SyncJournal>,
    hydration_tx: mpsc::UnboundedSender<RelativePath>,
}

impl SuffixVfs {
    /// Creates the strategy; the receiver delivers hydration requests to
    /// the folder loop.
    pub fn new(
        root: impl Into<PathBuf>,
        journal: Arc<SyncJournal>,
    ) -> (Self, mpsc::UnboundedReceiver<RelativePath>) {
        let (hydration_tx, hydration_rx) = mpsc::unbounded_channel();
        (
            Self {
                root: root.into(),
                journal,
                hydration_tx,
            },
            hydration_rx,
        )
    }

    fn absolute(&self, path: &RelativePath) -> PathBuf {
        let mut abs = self.root.clone();
        if !path.is_root() {
            abs.push(path.as_str());
        }
        abs
    }

    fn placeholder_path(&self, path: &RelativePath) -> PathBuf {
        let abs = self.absolute(path);
        match path.file_name() {
            Some(name) => abs.with_file_name(self.placeholder_file_name(name)),
            None => abs,
        }
    }
}

#[async_trait::async_trait]
impl Vfs for SuffixVfs {
    fn mode(&self) -> VfsMode {
        VfsMode::Suffix
    }

    async fn materialize_placeholder(
        &self,
        path: &RelativePath,
        metadata: &PlaceholderMetadata,
    ) -> anyhow::Result<()> {
        let target = self.placeholder_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&target).await?;
        debug!(path = %path, size = metadata.size, "Placeholder materialized");
        Ok(())
    }

    async fn hydrate(&self, path: &RelativePath) -> anyhow::Result<()> {
        info!(path = %path, "Hydration requested");
        self.hydration_tx
            .send(path.clone())
            .map_err(|_| anyhow::anyhow!("folder loop is gone, cannot hydrate {path}"))
    }

    async fn dehydrate(&self, path: &RelativePath) -> anyhow::Result<()> {
        let full = self.absolute(path);
        let placeholder = self.placeholder_path(path);

        tokio::fs::File::create(&placeholder).await?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(path = %path, "Dehydrated to placeholder");
        Ok(())
    }

    async fn pin_state(&self, path: &RelativePath) -> anyhow::Result<PinState> {
        Ok(self.journal.effective_pin_state(path).await?)
    }

    async fn set_pin_state(&self, path: &RelativePath, state: PinState) -> anyhow::Result<()> {
        self.journal.set_pin_state(path, state).await?;
        debug!(path = %path, state = %state, "Pin state stored");
        Ok(())
    }

    async fn availability(&self, path: &RelativePath) -> anyhow::Result<Availability> {
        let records = self.journal.iterate(path).await?;
        let mut folded: Option<Availability> = None;

        for record in &records {
            if record.kind == ItemKind::Directory {
                continue;
            }
            let pin = self.journal.effective_pin_state(&record.path).await?;
            let one = match (record.kind, pin) {
                (ItemKind::VirtualFile, PinState::OnlineOnly) => Availability::OnlineOnly,
                (ItemKind::VirtualFile, _) => Availability::AllDehydrated,
                (_, PinState::AlwaysLocal) => Availability::AlwaysLocal,
                _ => Availability::AllHydrated,
            };
            folded = Some(match folded {
                Some(acc) => acc.combine(one),
                None => one,
            });
        }

        Ok(folded.unwrap_or(match self.journal.effective_pin_state(path).await? {
            PinState::OnlineOnly => Availability::OnlineOnly,
            PinState::AlwaysLocal => Availability::AlwaysLocal,
            _ => Availability::AllHydrated,
        }))
    }

    fn is_placeholder(&self, file_name: &str) -> bool {
        file_name.len() > PLACEHOLDER_SUFFIX.len() && file_name.ends_with(PLACEHOLDER_SUFFIX)
    }

    fn underlying_file_name(&self, file_name: &str) -> String {
        file_name
            .strip_suffix(PLACEHOLDER_SUFFIX)
            .unwrap_or(file_name)
            .to_string()
    }

    fn placeholder_file_name(&self, file_name: &str) -> String {
        format!("{file_name}{PLACEHOLDER_SUFFIX}")
    }

    async fn on_file_status_changed(&self, path: &RelativePath, status: FileStatus) {
        debug!(path = %path, status = ?status, "File status changed");
    }
}

/// True when the on-disk path `p` looks like a placeholder file.
pub fn is_placeholder_path(p: &Path) -> bool {
    p.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.len() > PLACEHOLDER_SUFFIX.len() && n.ends_with(PLACEHOLDER_SUFFIX))
        .unwrap_or(false)
}
