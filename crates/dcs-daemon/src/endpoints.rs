//! Third-party HTTP endpoint registry and its side-channel bridge.
//!
//! Registering an endpoint binds a dedicated UNIX socket. The web
//! front-end connects to that socket per request, writes one
//! request-description frame plus the raw body, and reads one
//! response-description frame plus its body back. The daemon relays each
//! request over the owning IPC connection and matches answers FIFO.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dcs_core::command::HttpEndpointType;
use dcs_core::endpoint::{
    endpoint_socket_name, HttpEndpointRequest, HttpEndpointResponse, HttpRequestHeader,
    HttpResponseHeader,
};
use dcs_core::error::{ErrorType, IpcError};
use dcs_core::frame::encode_frame;

use crate::connection::FrameReader;

/// One relayed request plus the slot its answer lands in.
pub struct BridgeRequest {
    pub request: HttpEndpointRequest,
    pub respond: oneshot::Sender<HttpEndpointResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub method: HttpEndpointType,
    pub namespace: String,
    pub path: String,
}

struct EndpointEntry {
    owner: u32,
    socket_path: PathBuf,
    accept_task: JoinHandle<()>,
}

pub struct EndpointRegistry {
    socket_dir: PathBuf,
    reserved_namespaces: Vec<String>,
    max_frame_bytes: usize,
    entries: RwLock<HashMap<EndpointKey, EndpointEntry>>,
}

impl EndpointRegistry {
    pub fn new(socket_dir: PathBuf, reserved_namespaces: Vec<String>, max_frame_bytes: usize) -> Self {
        Self {
            socket_dir,
            reserved_namespaces,
            max_frame_bytes,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Bind the endpoint's dedicated socket and start bridging. Returns the
    /// socket path handed back to the registering client.
    pub fn register(
        &self,
        owner: u32,
        key: EndpointKey,
        _is_upload: bool,
        bridge: mpsc::Sender<BridgeRequest>,
    ) -> Result<PathBuf, IpcError> {
        if key.namespace.is_empty() || key.path.is_empty() {
            return Err(IpcError::invalid_argument(
                "endpoint namespace and path must not be empty",
            ));
        }
        if self
            .reserved_namespaces
            .iter()
            .any(|ns| ns.eq_ignore_ascii_case(&key.namespace))
        {
            return Err(IpcError::new(
                ErrorType::NamespaceReserved,
                format!("namespace {} is reserved", key.namespace),
            ));
        }

        let mut entries = self.entries.write().expect("endpoint table poisoned");
        if entries.contains_key(&key) {
            return Err(IpcError::new(
                ErrorType::AlreadyRegistered,
                format!(
                    "endpoint {} /{}/{} is already registered",
                    key.method.as_str(),
                    key.namespace,
                    key.path
                ),
            ));
        }

        let socket_path = self
            .socket_dir
            .join(endpoint_socket_name(key.method, &key.namespace, &key.path));
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        let accept_task = tokio::spawn(accept_loop(
            listener,
            key.clone(),
            bridge,
            self.max_frame_bytes,
        ));
        info!(
            event = "endpoint_registered",
            owner,
            method = key.method.as_str(),
            namespace = %key.namespace,
            path = %key.path,
            socket = %socket_path.display()
        );
        entries.insert(
            key,
            EndpointEntry {
                owner,
                socket_path: socket_path.clone(),
                accept_task,
            },
        );
        Ok(socket_path)
    }

    pub fn remove(&self, owner: u32, key: &EndpointKey) -> Result<(), IpcError> {
        let mut entries = self.entries.write().expect("endpoint table poisoned");
        match entries.get(key) {
            None => Err(IpcError::not_found(format!(
                "endpoint {} /{}/{} is not registered",
                key.method.as_str(),
                key.namespace,
                key.path
            ))),
            Some(entry) if entry.owner != owner => Err(IpcError::invalid_argument(
                "endpoint was registered by another connection",
            )),
            Some(_) => {
                let entry = entries.remove(key).expect("entry present");
                Self::tear_down(key, entry);
                Ok(())
            }
        }
    }

    /// Disconnect cleanup: every endpoint of the connection disappears with
    /// its socket.
    pub fn remove_for_connection(&self, owner: u32) {
        let mut entries = self.entries.write().expect("endpoint table poisoned");
        let keys: Vec<EndpointKey> = entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(entry) = entries.remove(&key) {
                Self::tear_down(&key, entry);
            }
        }
    }

    fn tear_down(key: &EndpointKey, entry: EndpointEntry) {
        entry.accept_task.abort();
        if let Err(err) = std::fs::remove_file(&entry.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    event = "endpoint_socket_unlink_failed",
                    socket = %entry.socket_path.display(),
                    error = %err
                );
            }
        }
        info!(
            event = "endpoint_removed",
            method = key.method.as_str(),
            namespace = %key.namespace,
            path = %key.path
        );
    }

    pub fn socket_path(&self, key: &EndpointKey) -> Option<PathBuf> {
        self.entries
            .read()
            .expect("endpoint table poisoned")
            .get(key)
            .map(|entry| entry.socket_path.clone())
    }
}

async fn accept_loop(
    listener: UnixListener,
    key: EndpointKey,
    bridge: mpsc::Sender<BridgeRequest>,
    max_frame_bytes: usize,
) {
    // One request at a time per endpoint; concurrent front-end connections
    // queue here.
    let gate = Arc::new(Mutex::new(()));
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let key = key.clone();
                let bridge = bridge.clone();
                let gate = gate.clone();
                tokio::spawn(async move {
                    let _serial = gate.lock().await;
                    if let Err(err) = serve_request(stream, &key, &bridge, max_frame_bytes).await {
                        warn!(
                            event = "endpoint_bridge_error",
                            namespace = %key.namespace,
                            path = %key.path,
                            error = %err
                        );
                    }
                });
            }
            Err(err) => {
                warn!(event = "endpoint_accept_error", error = %err);
                break;
            }
        }
    }
}

/// Serve exactly one front-end request over a fresh side connection.
async fn serve_request(
    stream: UnixStream,
    key: &EndpointKey,
    bridge: &mpsc::Sender<BridgeRequest>,
    max_frame_bytes: usize,
) -> Result<(), IpcError> {
    let cancel = CancellationToken::new();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, max_frame_bytes);

    let Some(frame) = reader.read_frame(&cancel).await? else {
        return Ok(());
    };
    let header: HttpRequestHeader = serde_json::from_value(frame)
        .map_err(|err| IpcError::deserialization(format!("invalid request header: {err}")))?;
    let body = reader.read_raw(header.content_length, &cancel).await?;

    let (respond_tx, respond_rx) = oneshot::channel();
    let delivered = bridge
        .send(BridgeRequest {
            request: HttpEndpointRequest {
                method: header.method,
                namespace: key.namespace.clone(),
                path: header.path,
                query: header.query,
                headers: header.headers,
                body: String::from_utf8_lossy(&body).into_owned(),
            },
            respond: respond_tx,
        })
        .await
        .is_ok();

    let response = if delivered {
        match respond_rx.await {
            Ok(response) => response,
            Err(_) => unavailable_response(),
        }
    } else {
        unavailable_response()
    };

    let body = response.body.into_bytes();
    let header = HttpResponseHeader {
        status_code: response.status_code,
        headers: response.headers,
        content_length: body.len(),
    };
    let frame = encode_frame(&header, max_frame_bytes)
        .map_err(|err| IpcError::protocol(err.to_string()))?;
    write_half.write_all(&frame).await?;
    write_half.write_all(&body).await?;
    write_half.flush().await?;
    Ok(())
}

/// Answer when the owning connection has gone away mid-request.
fn unavailable_response() -> HttpEndpointResponse {
    HttpEndpointResponse {
        status_code: 503,
        headers: HashMap::new(),
        body: "endpoint provider disconnected".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcs_core::frame::DEFAULT_MAX_FRAME_BYTES;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("dcs-endpoints-{name}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn key(method: HttpEndpointType, namespace: &str, path: &str) -> EndpointKey {
        EndpointKey {
            method,
            namespace: namespace.to_string(),
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn register_binds_a_socket_and_rejects_duplicates() {
        let dir = temp_dir("register");
        let registry = EndpointRegistry::new(
            dir.clone(),
            vec!["machine".to_string()],
            DEFAULT_MAX_FRAME_BYTES,
        );
        let (tx, _rx) = mpsc::channel(4);

        let path = registry
            .register(1, key(HttpEndpointType::GET, "fans", "status"), false, tx.clone())
            .expect("register");
        assert!(path.exists());

        let dup = registry
            .register(1, key(HttpEndpointType::GET, "fans", "status"), false, tx.clone())
            .expect_err("duplicate");
        assert_eq!(dup.error_type, ErrorType::AlreadyRegistered);

        let reserved = registry
            .register(1, key(HttpEndpointType::GET, "machine", "status"), false, tx)
            .expect_err("reserved");
        assert_eq!(reserved.error_type, ErrorType::NamespaceReserved);

        registry.remove_for_connection(1);
        assert!(!path.exists(), "socket unlinked on disconnect");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn bridge_relays_a_request_and_its_response() {
        let dir = temp_dir("bridge");
        let registry =
            EndpointRegistry::new(dir.clone(), Vec::new(), DEFAULT_MAX_FRAME_BYTES);
        let (tx, mut rx) = mpsc::channel::<BridgeRequest>(4);
        let socket = registry
            .register(1, key(HttpEndpointType::POST, "probe", "trigger"), false, tx)
            .expect("register");

        // Endpoint owner side: answer the one relayed request.
        let owner = tokio::spawn(async move {
            let bridged = rx.recv().await.expect("bridged request");
            assert_eq!(bridged.request.method, HttpEndpointType::POST);
            assert_eq!(bridged.request.namespace, "probe");
            assert_eq!(bridged.request.body, "P1");
            let _ = bridged.respond.send(HttpEndpointResponse {
                status_code: 200,
                headers: HashMap::new(),
                body: "triggered".to_string(),
            });
        });

        // Front-end side.
        let stream = UnixStream::connect(&socket).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let header = HttpRequestHeader {
            method: HttpEndpointType::POST,
            path: "trigger".to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            content_length: 2,
        };
        let mut bytes = encode_frame(&header, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        bytes.extend_from_slice(b"P1");
        write_half.write_all(&bytes).await.expect("write");

        let cancel = CancellationToken::new();
        let mut reader = FrameReader::new(read_half, DEFAULT_MAX_FRAME_BYTES);
        let frame = reader
            .read_frame(&cancel)
            .await
            .expect("read")
            .expect("response header");
        let response: HttpResponseHeader = serde_json::from_value(frame).expect("decode");
        assert_eq!(response.status_code, 200);
        let body = reader
            .read_raw(response.content_length, &cancel)
            .await
            .expect("body");
        assert_eq!(body, b"triggered");

        owner.await.expect("join");
        registry.remove_for_connection(1);
        std::fs::remove_dir_all(dir).ok();
    }
}
