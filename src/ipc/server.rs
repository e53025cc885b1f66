// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC server: accepts client connections, enforces the bearer token, and
//! forwards typed requests to the host's handler.
//!
//! Each connection is one task: hello/ack handshake, then a request loop.
//! Connect/disconnect callbacks keep the host's idle watchdog and session
//! bindings current; the session ids seen on a connection are reported on
//! disconnect so the host can unbind them.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use rand::RngCore;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TransportPreference;
use crate::error::{codes, IpcError};

use super::protocol::{decode, encode, ClientHello, CoreRequest, CoreResponse, HelloAck};
use super::transport::{self, EndpointInfo, IpcStream};

/// Async handler the host plugs into the server.
pub type RequestHandler = Arc<
    dyn Fn(CoreRequest) -> Pin<Box<dyn Future<Output = CoreResponse> + Send>> + Send + Sync,
>;

/// Called when a client connects.
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
/// Called when a client disconnects, with the session ids it used.
pub type DisconnectCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Generate a fresh bearer token (hex).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Token-authenticated IPC server.
pub struct IpcServer {
    token: String,
    server_version: String,
    runtime_dir: PathBuf,
    preference: TransportPreference,
    handler: RequestHandler,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    pub fn new(
        runtime_dir: PathBuf,
        preference: TransportPreference,
        server_version: &str,
        handler: RequestHandler,
        on_connect: Option<ConnectCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Self {
        Self {
            token: generate_token(),
            server_version: server_version.to_string(),
            runtime_dir,
            preference,
            handler,
            on_connect,
            on_disconnect,
            accept_task: Mutex::new(None),
        }
    }

    /// The bearer token clients must present. Rotated on each server
    /// construction.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Bind the transport and start accepting connections.
    pub async fn start(&self) -> Result<EndpointInfo, IpcError> {
        let (listener, endpoint) = transport::bind(self.preference, &self.runtime_dir)
            .await
            .map_err(|e| IpcError::from_io_error("binding endpoint", e))?;
        info!(
            "IPC server listening on {} ({})",
            endpoint.address, endpoint.transport
        );

        let token = self.token.clone();
        let server_version = self.server_version.clone();
        let handler = Arc::clone(&self.handler);
        let on_connect = self.on_connect.clone();
        let on_disconnect = self.on_disconnect.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        debug!("New IPC connection accepted");
                        if let Some(ref cb) = on_connect {
                            cb();
                        }
                        let token = token.clone();
                        let server_version = server_version.clone();
                        let handler = Arc::clone(&handler);
                        let on_disconnect = on_disconnect.clone();
                        tokio::spawn(async move {
                            let sessions =
                                Self::serve_connection(stream, &token, &server_version, handler)
                                    .await;
                            if let Some(cb) = on_disconnect {
                                cb(sessions);
                            }
                        });
                    }
                    Err(e) => {
                        error!("IPC accept failed: {e}");
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().await = Some(accept_task);

        Ok(endpoint)
    }

    /// Stop accepting and remove the socket file. In-flight connections
    /// finish their current request and then see EOF.
    pub async fn stop(&self) {
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        transport::cleanup(&self.runtime_dir);
        info!("IPC server stopped");
    }

    /// Serve one connection; returns the session ids it used.
    async fn serve_connection(
        stream: IpcStream,
        token: &str,
        server_version: &str,
        handler: RequestHandler,
    ) -> Vec<String> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut sessions: HashSet<String> = HashSet::new();

        // Handshake.
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return Vec::new(),
            Ok(_) => {}
        }
        let hello: Result<ClientHello, _> = decode(&line);
        let ack = match hello {
            Ok(hello) if hello.token == token => HelloAck {
                ok: true,
                server_version: server_version.to_string(),
                error_code: None,
                message: None,
            },
            Ok(_) => HelloAck {
                ok: false,
                server_version: server_version.to_string(),
                error_code: Some(codes::AUTH_STALE_TOKEN.to_string()),
                message: Some(
                    "Bearer token mismatch; re-read the token file and reconnect".to_string(),
                ),
            },
            Err(e) => {
                warn!("Malformed hello: {e}");
                HelloAck {
                    ok: false,
                    server_version: server_version.to_string(),
                    error_code: Some(codes::AUTH_FAILED.to_string()),
                    message: Some("Malformed hello message".to_string()),
                }
            }
        };
        let accepted = ack.ok;
        if let Ok(encoded) = encode(&ack) {
            let _ = write_half.write_all(encoded.as_bytes()).await;
            let _ = write_half.flush().await;
        }
        if !accepted {
            return Vec::new();
        }

        // Request loop.
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("IPC read error: {e}");
                    break;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            let response = match decode::<CoreRequest>(&line) {
                Ok(request) => {
                    sessions.insert(request.session_id.clone());
                    handler(request).await
                }
                Err(e) => {
                    warn!("Malformed request: {e}");
                    CoreResponse::failure(
                        "",
                        codes::INVALID_PARAMS,
                        format!("Malformed request envelope: {e}"),
                    )
                }
            };

            match encode(&response) {
                Ok(encoded) => {
                    if write_half.write_all(encoded.as_bytes()).await.is_err() {
                        break;
                    }
                    if write_half.flush().await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to encode response: {e}");
                    break;
                }
            }
        }

        debug!("IPC connection closed");
        sessions.into_iter().collect()
    }
}
