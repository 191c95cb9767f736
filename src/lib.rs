pub mod canary;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod editor;
pub mod errors;
pub mod http;
pub mod mapper;
pub mod models;
pub mod protocol;
pub mod store;
pub mod support_files;
pub mod watcher;
pub mod widget;

pub use crate::dispatcher::{SaveOutcome, SyncCore};
pub use crate::errors::{AppError, AppResult};

use crate::config::{SyncSettings, ROOT_ENV, STATE_DIR};
use crate::editor::{Editor, HeadlessEditor};
use crate::watcher::SaveWatcher;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Both listeners plus the optional file watcher, bound to one `SyncCore`.
pub struct RunningService {
    core: Arc<SyncCore>,
    shutdown: watch::Sender<bool>,
    http_task: JoinHandle<AppResult<()>>,
    channel_task: JoinHandle<AppResult<()>>,
    watcher: Option<SaveWatcher>,
    http_address: SocketAddr,
    channel_address: SocketAddr,
}

impl RunningService {
    pub fn core(&self) -> &Arc<SyncCore> {
        &self.core
    }

    pub fn http_address(&self) -> SocketAddr {
        self.http_address
    }

    pub fn channel_address(&self) -> SocketAddr {
        self.channel_address
    }

    pub async fn shutdown(self) -> AppResult<()> {
        self.core.stop().await;
        let _ = self.shutdown.send(true);
        if let Some(watcher) = self.watcher {
            watcher.stop();
        }
        for task in [self.http_task, self.channel_task] {
            match task.await {
                Ok(result) => result?,
                Err(error) => return Err(AppError::Internal(error.to_string())),
            }
        }
        Ok(())
    }
}

/// Installs support files, binds both listeners and starts serving.
pub async fn start(
    root: PathBuf,
    settings: &SyncSettings,
    editor: Arc<dyn Editor>,
) -> AppResult<RunningService> {
    match support_files::install(&root) {
        Ok(report) => tracing::info!(
            project_config_written = report.project_config_written,
            "support files installed"
        ),
        Err(error) => tracing::warn!(error = %error, "support files not installed"),
    }

    let http_listener = bind(&settings.http_address()).await?;
    let channel_listener = bind(&settings.channel_address()).await?;
    let http_address = local_address(&http_listener)?;
    let channel_address = local_address(&channel_listener)?;

    let core = SyncCore::new(root, editor);
    core.start();
    let (shutdown, shutdown_receiver) = watch::channel(false);

    let http_task = tokio::spawn(http::serve_http(
        http_listener,
        core.clone(),
        shutdown_receiver.clone(),
    ));
    let channel_task = tokio::spawn(channel::serve_channel(
        channel_listener,
        core.clone(),
        shutdown_receiver,
    ));

    let watcher = if settings.watch_files {
        match SaveWatcher::spawn(core.clone()) {
            Ok(watcher) => Some(watcher),
            Err(error) => {
                tracing::warn!(error = %error, "file watcher unavailable");
                None
            }
        }
    } else {
        None
    };

    tracing::info!(http = %http_address, channel = %channel_address, "scriptsync listening");
    Ok(RunningService {
        core,
        shutdown,
        http_task,
        channel_task,
        watcher,
        http_address,
        channel_address,
    })
}

/// Binary entry: resolve the workspace, start serving, stop on ctrl-c.
pub async fn run() -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let env_root = std::env::var(ROOT_ENV).ok();
    let base = env_root.clone().map(PathBuf::from).unwrap_or_else(|| cwd.clone());
    let loaded = SyncSettings::try_load(&base);
    let settings = loaded.as_ref().cloned().unwrap_or_default();
    let root = config::resolve_root(env_root, &settings, &cwd);
    std::fs::create_dir_all(&root)?;
    init_tracing(&root).map_err(anyhow::Error::msg)?;
    if let Err(error) = &loaded {
        tracing::warn!(error = %error, "settings not loaded, using defaults");
    }

    let service = start(root, &settings, Arc::new(HeadlessEditor::new())).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    service.shutdown().await?;
    Ok(())
}

async fn bind(address: &str) -> AppResult<TcpListener> {
    TcpListener::bind(address)
        .await
        .map_err(|error| AppError::Transport(format!("{address}: {error}")))
}

fn local_address(listener: &TcpListener) -> AppResult<SocketAddr> {
    listener
        .local_addr()
        .map_err(|error| AppError::Transport(error.to_string()))
}

fn init_tracing(root: &Path) -> Result<(), String> {
    let log_dir = root.join(STATE_DIR).join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "scriptsync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
