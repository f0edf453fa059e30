//! UNIX socket server for the helper daemon.
//!
//! Accepts many concurrent clients on a group-restricted socket, parses
//! newline-framed JSON requests, routes them to the registered handler
//! and broadcasts controller events to every attached client.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use nix::unistd::Group;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::helper::protocol::{Event, Request, Response, ERR_INVALID_REQUEST, MAX_LINE_BYTES};

/// Default path for the helper socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/openfortivpn-gui/helper.sock";
/// Default group allowed to reach the socket.
pub const DEFAULT_SOCKET_GROUP: &str = "openfortivpn-gui";
/// Cap on concurrently attached clients; excess connections are accepted
/// and immediately closed.
pub const MAX_CLIENTS: usize = 16;

/// Handles a single request and produces the response to send back.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: Request) -> Response;
}

/// Manages client connections over a UNIX socket.
pub struct Server {
    socket_path: PathBuf,
    socket_group: Option<String>,
    handler: Arc<dyn RequestHandler>,
    flags: Mutex<Flags>,
    clients: Arc<RwLock<HashMap<u64, Arc<ClientConn>>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

#[derive(Default)]
struct Flags {
    running: bool,
    // Closes the check-then-act window between the running check and the
    // listener actually being up.
    starting: bool,
}

impl Server {
    /// Creates a server. Events arriving on `events` are broadcast to
    /// every attached client once the server is started.
    pub fn new(
        socket_path: impl Into<PathBuf>,
        socket_group: Option<String>,
        handler: Arc<dyn RequestHandler>,
        events: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            socket_group,
            handler,
            flags: Mutex::new(Flags::default()),
            clients: Arc::new(RwLock::new(HashMap::new())),
            events: Mutex::new(Some(events)),
            shutdown: Mutex::new(None),
        }
    }

    /// Begins listening for connections.
    ///
    /// Returns [`ServerError::AlreadyRunning`] if the server is already
    /// running or currently starting.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut flags = self.flags.lock().unwrap();
            if flags.running || flags.starting {
                return Err(ServerError::AlreadyRunning);
            }
            flags.starting = true;
        }

        match self.bind_and_spawn() {
            Ok(()) => {
                let mut flags = self.flags.lock().unwrap();
                flags.running = true;
                flags.starting = false;
                Ok(())
            }
            Err(err) => {
                self.flags.lock().unwrap().starting = false;
                Err(err)
            }
        }
    }

    fn bind_and_spawn(&self) -> Result<(), ServerError> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ServerError::RemoveStale {
                    path: self.socket_path.clone(),
                    source: err,
                })
            }
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| ServerError::Bind {
                path: self.socket_path.clone(),
                source: err,
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|err| ServerError::Bind {
            path: self.socket_path.clone(),
            source: err,
        })?;

        if let Err(err) = self.set_socket_ownership() {
            let _ = std::fs::remove_file(&self.socket_path);
            return Err(err);
        }
        if let Err(err) = std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(0o660),
        ) {
            let _ = std::fs::remove_file(&self.socket_path);
            return Err(ServerError::Permissions(err));
        }

        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap() = Some(token.clone());

        if let Some(events) = self.events.lock().unwrap().take() {
            tokio::spawn(broadcast_loop(
                Arc::clone(&self.clients),
                events,
                token.clone(),
            ));
        }
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.handler),
            Arc::clone(&self.clients),
            token,
        ));

        tracing::info!(
            socket = %self.socket_path.display(),
            group = self.socket_group.as_deref().unwrap_or(""),
            "helper server listening"
        );
        Ok(())
    }

    /// Leaves the owner untouched and adjusts only the group, so the
    /// socket ends up root:<group> 0660.
    fn set_socket_ownership(&self) -> Result<(), ServerError> {
        let Some(group_name) = self.socket_group.as_deref() else {
            return Ok(());
        };
        if group_name.is_empty() {
            return Ok(());
        }

        let group = Group::from_name(group_name)
            .map_err(|err| ServerError::Ownership(err.to_string()))?
            .ok_or_else(|| ServerError::GroupNotFound(group_name.to_string()))?;
        nix::unistd::chown(&self.socket_path, None, Some(group.gid))
            .map_err(|err| ServerError::Ownership(err.to_string()))?;
        tracing::debug!(group = group_name, gid = %group.gid, "socket group ownership set");
        Ok(())
    }

    /// Shuts the server down. A stopped server is left untouched.
    pub async fn stop(&self) {
        {
            let mut flags = self.flags.lock().unwrap();
            if !flags.running {
                return;
            }
            flags.running = false;
        }

        if let Some(token) = self.shutdown.lock().unwrap().take() {
            token.cancel();
        }

        let clients: Vec<Arc<ClientConn>> = {
            let mut clients = self.clients.write().unwrap();
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            let mut writer = client.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    path = %self.socket_path.display(),
                    error = %err,
                    "failed to remove socket file"
                );
            }
        }
        tracing::info!("helper server stopped");
    }

    /// Number of currently attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}

/// One attached client. The write mutex makes a single JSON line the
/// atomic write unit even when responses and broadcasts race.
struct ClientConn {
    id: u64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl ClientConn {
    async fn send<T: Serialize>(&self, message: &T) -> io::Result<()> {
        let mut payload = serde_json::to_vec(message).map_err(io::Error::other)?;
        payload.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&payload).await?;
        writer.flush().await
    }
}

type ClientMap = Arc<RwLock<HashMap<u64, Arc<ClientConn>>>>;

async fn accept_loop(
    listener: UnixListener,
    handler: Arc<dyn RequestHandler>,
    clients: ClientMap,
    token: CancellationToken,
) {
    let next_client_id = AtomicU64::new(1);
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _addr)) => {
                let attached = clients.read().unwrap().len();
                if attached >= MAX_CLIENTS {
                    tracing::warn!(attached, "client limit reached, dropping connection");
                    drop(stream);
                    continue;
                }

                let (read_half, write_half) = stream.into_split();
                let id = next_client_id.fetch_add(1, Ordering::Relaxed);
                let client = Arc::new(ClientConn {
                    id,
                    writer: tokio::sync::Mutex::new(write_half),
                });
                {
                    let mut clients = clients.write().unwrap();
                    clients.insert(id, Arc::clone(&client));
                    tracing::info!(clients = clients.len(), "client connected");
                }
                tokio::spawn(serve_client(
                    Arc::clone(&handler),
                    Arc::clone(&clients),
                    client,
                    read_half,
                    token.clone(),
                ));
            }
            Err(err) => {
                if token.is_cancelled() {
                    return;
                }
                tracing::error!(error = %err, "accept failed");
            }
        }
    }
}

async fn serve_client(
    handler: Arc<dyn RequestHandler>,
    clients: ClientMap,
    client: Arc<ClientConn>,
    read_half: OwnedReadHalf,
    token: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = read_frame(&mut reader, &mut buf) => frame,
        };
        match frame {
            Ok(Frame::Eof) => break,
            Ok(Frame::Oversize) => {
                // Framing-fatal: answer once, then drop the connection.
                let response = Response::error(
                    "",
                    ERR_INVALID_REQUEST,
                    format!("request line exceeds {MAX_LINE_BYTES} bytes"),
                );
                if let Err(err) = client.send(&response).await {
                    tracing::debug!(client = client.id, error = %err, "failed to report oversize request");
                }
                break;
            }
            Ok(Frame::Line) => {
                let response = match parse_request(&buf) {
                    Ok(request) => handler.handle_request(request).await,
                    Err(salvaged_id) => {
                        tracing::warn!(client = client.id, "invalid request");
                        Response::error(salvaged_id, ERR_INVALID_REQUEST, "invalid JSON")
                    }
                };
                if let Err(err) = client.send(&response).await {
                    tracing::error!(client = client.id, error = %err, "failed to send response");
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(client = client.id, error = %err, "client read failed");
                break;
            }
        }
    }

    remove_client(&clients, client.id);
}

fn remove_client(clients: &RwLock<HashMap<u64, Arc<ClientConn>>>, id: u64) {
    let mut clients = clients.write().unwrap();
    if clients.remove(&id).is_some() {
        tracing::info!(clients = clients.len(), "client disconnected");
    }
}

/// Parses a request line. On failure returns whatever id could be
/// salvaged from the raw JSON so the error response still correlates.
fn parse_request(raw: &[u8]) -> Result<Request, String> {
    let value: Value = serde_json::from_slice(raw).map_err(|_| String::new())?;
    let salvaged_id = value
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(value).map_err(|_| salvaged_id)
}

async fn broadcast_loop(
    clients: ClientMap,
    mut events: mpsc::UnboundedReceiver<Event>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        // Snapshot under the read lock, write outside it.
        let targets: Vec<Arc<ClientConn>> =
            clients.read().unwrap().values().cloned().collect();
        for client in targets {
            if let Err(err) = client.send(&event).await {
                tracing::warn!(client = client.id, error = %err, "failed to send event to client");
            }
        }
    }
}

enum Frame {
    /// A complete line is in the buffer, delimiter stripped.
    Line,
    /// The frame exceeded [`MAX_LINE_BYTES`]; the connection must go.
    Oversize,
    Eof,
}

/// Reads one newline-terminated frame, enforcing the length cap including
/// the delimiter. A final partial line without delimiter counts as EOF.
async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<Frame> {
    loop {
        let (consumed, result) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(Frame::Eof);
            }
            match available.iter().position(|&byte| byte == b'\n') {
                Some(pos) => {
                    if buf.len() + pos + 1 > MAX_LINE_BYTES {
                        (pos + 1, Some(Frame::Oversize))
                    } else {
                        buf.extend_from_slice(&available[..pos]);
                        (pos + 1, Some(Frame::Line))
                    }
                }
                None => {
                    if buf.len() + available.len() > MAX_LINE_BYTES {
                        (available.len(), Some(Frame::Oversize))
                    } else {
                        buf.extend_from_slice(available);
                        (available.len(), None)
                    }
                }
            }
        };
        reader.consume(consumed);
        if let Some(frame) = result {
            return Ok(frame);
        }
    }
}
