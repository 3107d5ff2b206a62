//! Daemon wiring and the accept loop.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Settings;
use crate::endpoints::EndpointRegistry;
use crate::files::FileService;
use crate::handshake;
use crate::machine::fanout::Fanout;
use crate::machine::interceptors::InterceptorRegistry;
use crate::machine::lock::LockManager;
use crate::machine::model::ModelStore;
use crate::machine::pipeline::{CodeExecutor, CodePipeline, FirmwareStub};
use crate::plugins::PluginRegistry;
use crate::sessions::SessionRegistry;

/// Everything a connection's processor reaches for, behind one `Arc`.
pub struct Daemon {
    pub settings: Settings,
    pub fanout: Arc<Fanout>,
    pub model: ModelStore,
    pub lock: LockManager,
    pub interceptors: Arc<InterceptorRegistry>,
    pub pipeline: CodePipeline,
    pub sessions: SessionRegistry,
    pub plugins: PluginRegistry,
    pub endpoints: EndpointRegistry,
    pub files: FileService,
    connection_ids: AtomicU32,
    updating: AtomicBool,
}

impl Daemon {
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_executor(settings, Arc::new(FirmwareStub))
    }

    pub fn with_executor(settings: Settings, executor: Arc<dyn CodeExecutor>) -> Arc<Self> {
        let fanout = Arc::new(Fanout::new());
        let interceptors = Arc::new(InterceptorRegistry::new());
        Arc::new(Self {
            fanout: fanout.clone(),
            model: ModelStore::new(fanout),
            lock: LockManager::new(),
            pipeline: CodePipeline::new(interceptors.clone(), executor),
            interceptors,
            sessions: SessionRegistry::new(),
            plugins: PluginRegistry::new(),
            endpoints: EndpointRegistry::new(
                settings.endpoint_dir.clone(),
                settings.reserved_namespaces.clone(),
                settings.max_frame_bytes,
            ),
            files: FileService::new(settings.base_dir.clone()),
            settings,
            connection_ids: AtomicU32::new(0),
            updating: AtomicBool::new(false),
        })
    }

    pub fn next_connection_id(&self) -> u32 {
        self.connection_ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_updating(&self, updating: bool) {
        self.updating.store(updating, Ordering::SeqCst);
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }
}

/// Bind the command socket and serve until shutdown flips.
pub async fn run(settings: Settings, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    if let Some(parent) = settings.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o755));
    }
    if settings.socket_path.exists() {
        let _ = fs::remove_file(&settings.socket_path);
    }

    let listener = UnixListener::bind(&settings.socket_path)?;
    let _ = fs::set_permissions(&settings.socket_path, fs::Permissions::from_mode(0o660));

    let daemon = Daemon::new(settings.clone());
    info!(
        event = "daemon_start",
        socket = %settings.socket_path.display(),
        base_dir = %settings.base_dir.display()
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            handshake::serve(daemon, stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&settings.socket_path);
    info!(event = "daemon_stop");
    Ok(())
}
