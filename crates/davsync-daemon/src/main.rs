//! davsyncd - Background synchronization daemon
//!
//! Wires the pieces together for each configured sync root: journal,
//! WebDAV client, virtual-file strategy, filesystem watcher and the
//! folder loop. Runs until SIGTERM/SIGINT, then waits for in-flight jobs
//! to observe the cancellation.
//!
//! Usage: `davsyncd <config.yaml>`. Credentials come from the
//! environment; the daemon never persists secrets.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use davsync_core::config::{Config, VfsMode};
use davsync_core::ports::credentials::StaticCredentials;
use davsync_core::ports::{RemoteClient, Vfs};
use davsync_dav::DavClient;
use davsync_engine::exclude::ExcludeEngine;
use davsync_engine::folder::{Folder, FolderCommand};
use davsync_engine::queue::JobQueue;
use davsync_engine::watcher::FileWatcher;
use davsync_journal::{JournalDb, SyncJournal};
use davsync_vfs::{SuffixVfs, VfsOff};

/// One sync pair in the daemon configuration.
#[derive(Debug, Deserialize)]
struct RootConfig {
    name: String,
    local_path: PathBuf,
}

/// The daemon's YAML configuration file.
#[derive(Debug, Deserialize)]
struct DaemonConfig {
    server_url: String,
    username: String,
    /// Name of the environment variable holding the password or app
    /// token.
    #[serde(default = "default_password_env")]
    password_env: String,
    roots: Vec<RootConfig>,
    #[serde(default)]
    engine: Config,
}

fn default_password_env() -> String {
    "DAVSYNC_PASSWORD".to_string()
}

/// A fully wired sync root.
struct RootService {
    folder: Arc<Folder>,
    commands: mpsc::Sender<FolderCommand>,
    handle: tokio::task::JoinHandle<()>,
    /// Keeps the OS watcher registered for the daemon's lifetime.
    _watcher: Option<FileWatcher>,
}

async fn start_root(
    root_config: &RootConfig,
    daemon: &DaemonConfig,
    remote: Arc<dyn RemoteClient>,
    queue: Arc<JobQueue>,
    cancel: &CancellationToken,
) -> Result<RootService> {
    let identity = format!("{}#{}", daemon.server_url, root_config.name);
    let (db, first_sync) = JournalDb::open(&root_config.local_path, &identity)
        .await
        .with_context(|| format!("opening journal for {}", root_config.name))?;
    let journal = Arc::new(SyncJournal::new(db.pool().clone()));

    // per-root exclude file, one glob per line
    let exclude_file = root_config.local_path.join(".davsync-exclude.lst");
    let user_patterns: Vec<String> = match tokio::fs::read_to_string(&exclude_file).await {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    };
    let excludes = Arc::new(
        ExcludeEngine::new(
            &user_patterns,
            !daemon.engine.sync.sync_hidden_files,
            Some(&JournalDb::file_name(&identity)),
        )
        .with_conflict_files_excluded(daemon.engine.sync.exclude_conflict_files),
    );

    let (vfs, hydration_rx): (Arc<dyn Vfs>, _) = match daemon.engine.vfs.mode {
        VfsMode::Suffix => {
            let (vfs, rx) = SuffixVfs::new(&root_config.local_path, Arc::clone(&journal));
            (Arc::new(vfs), Some(rx))
        }
        _ => (Arc::new(VfsOff), None),
    };

    let folder = Folder::new(
        root_config.name.clone(),
        root_config.local_path.clone(),
        remote,
        journal,
        vfs,
        excludes,
        queue,
        daemon.engine.clone(),
        first_sync,
    );
    if let Some(rx) = hydration_rx {
        folder.set_hydration_receiver(rx);
    }

    let (watcher, watcher_rx) = match FileWatcher::new() {
        Ok((mut watcher, rx)) => match watcher.watch(&root_config.local_path) {
            Ok(()) => (Some(watcher), Some(rx)),
            Err(e) => {
                warn!(root = %root_config.name, error = %e, "Watcher unavailable, falling back to full scans");
                (None, None)
            }
        },
        Err(e) => {
            warn!(root = %root_config.name, error = %e, "Watcher unavailable, falling back to full scans");
            (None, None)
        }
    };

    let (commands_tx, commands_rx) = mpsc::channel(16);
    let handle = tokio::spawn(Arc::clone(&folder).run_loop(
        commands_rx,
        watcher_rx,
        cancel.clone(),
    ));

    // first run right away
    commands_tx.send(FolderCommand::SyncNow).await.ok();

    Ok(RootService {
        folder,
        commands: commands_tx,
        handle,
        _watcher: watcher,
    })
}

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .context("usage: davsyncd <config.yaml>")?;
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading {config_path}"))?;
    let daemon: DaemonConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {config_path}"))?;

    let validation = daemon.engine.validate();
    if !validation.is_empty() {
        for problem in &validation {
            error!(%problem, "Invalid configuration");
        }
        bail!("configuration is invalid");
    }
    if daemon.roots.is_empty() {
        bail!("no sync roots configured");
    }

    let password = std::env::var(&daemon.password_env).with_context(|| {
        format!(
            "environment variable {} must hold the account password",
            daemon.password_env
        )
    })?;

    let server_url = Url::parse(&daemon.server_url).context("invalid server_url")?;
    let credentials = Arc::new(StaticCredentials::basic(&daemon.username, password));
    let remote: Arc<dyn RemoteClient> = Arc::new(
        DavClient::new(server_url, &daemon.username, credentials)
            .map_err(|e| anyhow::anyhow!("building dav client: {e}"))?,
    );

    let queue = Arc::new(JobQueue::new(daemon.engine.propagator.global_job_limit));
    let cancel = CancellationToken::new();

    let mut services = Vec::new();
    for root in &daemon.roots {
        let service = start_root(root, &daemon, Arc::clone(&remote), Arc::clone(&queue), &cancel)
            .await?;
        info!(root = %root.name, path = %root.local_path.display(), "Sync root started");
        services.push(service);
    }

    wait_for_shutdown().await;
    info!("Shutdown requested, stopping sync roots");

    for service in &services {
        service.commands.send(FolderCommand::Abort).await.ok();
    }
    cancel.cancel();
    for service in services {
        if let Err(e) = service.handle.await {
            warn!(folder = %service.folder.name(), error = %e, "Folder loop ended abnormally");
        }
    }

    info!("Daemon stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Daemon failed");
        std::process::exit(1);
    }
}
