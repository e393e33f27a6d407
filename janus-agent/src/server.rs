//! Unix socket listener.
//!
//! [`AgentServer::bind`] prepares and binds the socket; [`AgentServer::run`]
//! accepts connections and spawns one [`AgentSession`] task per client until
//! a [`ShutdownHandle`] fires.  Shutdown stops accepting only: sessions
//! already running finish on their own.

use std::io;
use std::os::unix::fs::{DirBuilderExt as _, FileTypeExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keystore::KeyStore;
use crate::session::AgentSession;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Concurrent session limit; 0 means unbounded.  Connections over the
    /// limit wait in the listen backlog.
    pub max_sessions: usize,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_sessions: 0,
        }
    }
}

/// Requests the server to stop accepting connections.  Cloneable and
/// idempotent.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if !self.tx.send_replace(true) {
            info!("agent shutdown requested");
        }
    }
}

/// Removes the socket file when the server goes away.
#[derive(Debug)]
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "agent socket removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove agent socket: {e}"),
        }
    }
}

#[derive(Debug)]
pub struct AgentServer {
    listener: UnixListener,
    store: Arc<KeyStore>,
    sessions: Option<Arc<Semaphore>>,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
    guard: SocketGuard,
}

impl AgentServer {
    /// Bind the listening socket.  Must be called inside a Tokio runtime.
    ///
    /// Fails with `AddrInUse` if another agent already answers on the path.
    /// A stale socket file left by a dead agent is removed first.
    pub fn bind(config: &ServerConfig, store: Arc<KeyStore>) -> Result<Self> {
        let path = &config.socket_path;
        prepare_socket_path(path)?;

        let listener = UnixListener::bind(path)?;
        let guard = SocketGuard { path: path.clone() };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        let (tx, shutdown_rx) = watch::channel(false);
        let sessions = (config.max_sessions > 0).then(|| Arc::new(Semaphore::new(config.max_sessions)));

        debug!(
            path = %path.display(),
            max_sessions = config.max_sessions,
            "agent socket bound"
        );

        Ok(Self {
            listener,
            store,
            sessions,
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
            shutdown_rx,
            guard,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.guard.path
    }

    /// Accept connections until shutdown.  The socket file is removed on
    /// return.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            store,
            sessions,
            shutdown: _shutdown,
            mut shutdown_rx,
            guard,
        } = self;

        info!(path = %guard.path.display(), "agent listening");
        let mut next_id: u64 = 0;

        loop {
            let permit = match &sessions {
                Some(limit) => tokio::select! {
                    permit = Arc::clone(limit).acquire_owned() => Some(
                        permit.map_err(|_| Error::Internal("session limit closed".into()))?,
                    ),
                    () = stopped(&mut shutdown_rx) => break,
                },
                None => None,
            };

            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                () = stopped(&mut shutdown_rx) => break,
            };

            next_id += 1;
            spawn_session(next_id, stream, Arc::clone(&store), permit);
        }

        info!(path = %guard.path.display(), "agent stopped accepting connections");
        drop(listener);
        drop(guard);
        Ok(())
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn spawn_session(
    id: u64,
    stream: UnixStream,
    store: Arc<KeyStore>,
    permit: Option<OwnedSemaphorePermit>,
) {
    match stream.peer_cred() {
        Ok(cred) => debug!(session = id, uid = cred.uid(), pid = ?cred.pid(), "session accepted"),
        Err(e) => debug!(session = id, "session accepted, peer credentials unavailable: {e}"),
    }

    tokio::spawn(async move {
        let _permit = permit;
        match AgentSession::new(store).serve(stream).await {
            Ok(()) => debug!(session = id, "session closed"),
            Err(e) => warn!(session = id, kind = e.kind(), error = %e, "session ended"),
        }
    });
}

/// Make `path` bindable: private parent directory, no stale socket.
fn prepare_socket_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !meta.file_type().is_socket() {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )));
    }

    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another agent is listening on {}", path.display()),
        )));
    }

    warn!(path = %path.display(), "removing stale agent socket");
    std::fs::remove_file(path)?;
    Ok(())
}
