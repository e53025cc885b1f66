// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC transport: unix domain socket preferred, loopback TCP fallback.
//!
//! The chosen endpoint is described by [`EndpointInfo`], which the host
//! writes to the runtime directory for client discovery.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::config::TransportPreference;

/// Serialized endpoint descriptor (`core.endpoint`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub transport: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

pub trait IpcIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IpcIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type IpcStream = Box<dyn IpcIo>;

/// Bound listener for either transport.
pub enum IpcListener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl IpcListener {
    pub async fn accept(&self) -> io::Result<IpcStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Socket path inside a runtime directory.
pub fn socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("core.sock")
}

/// Bind according to preference, returning the listener and its endpoint
/// descriptor.
pub async fn bind(
    preference: TransportPreference,
    runtime_dir: &Path,
) -> io::Result<(IpcListener, EndpointInfo)> {
    std::fs::create_dir_all(runtime_dir)?;

    #[cfg(unix)]
    if preference != TransportPreference::Tcp {
        let path = socket_path(runtime_dir);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        match UnixListener::bind(&path) {
            Ok(listener) => {
                return Ok((
                    IpcListener::Unix(listener),
                    EndpointInfo {
                        transport: "unix".to_string(),
                        address: path.to_string_lossy().to_string(),
                        port: None,
                    },
                ));
            }
            Err(e) if preference == TransportPreference::Unix => return Err(e),
            Err(_) => {}
        }
    }

    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    Ok((
        IpcListener::Tcp(listener),
        EndpointInfo {
            transport: "tcp".to_string(),
            address: "127.0.0.1".to_string(),
            port: Some(port),
        },
    ))
}

/// Connect to an endpoint published in the runtime directory.
pub async fn connect(endpoint: &EndpointInfo) -> io::Result<IpcStream> {
    match endpoint.transport.as_str() {
        #[cfg(unix)]
        "unix" => {
            let stream = UnixStream::connect(&endpoint.address).await?;
            Ok(Box::new(stream))
        }
        "tcp" => {
            let port = endpoint.port.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "tcp endpoint missing port")
            })?;
            let stream = TcpStream::connect((endpoint.address.as_str(), port)).await?;
            Ok(Box::new(stream))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unknown transport: {other}"),
        )),
    }
}

/// Remove the unix socket file, if any.
pub fn cleanup(runtime_dir: &Path) {
    let path = socket_path(runtime_dir);
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}
