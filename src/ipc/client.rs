// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC client used by the CLI (and by other local processes attaching to a
//! running core).
//!
//! Discovery reads the endpoint descriptor and bearer token from the
//! runtime directory; a stale-token rejection means the daemon restarted
//! since the files were read.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::debug;

use crate::error::{codes, IpcError};
use crate::paths;

use super::protocol::{decode, encode, ClientHello, CoreRequest, CoreResponse, HelloAck};
use super::transport::{self, EndpointInfo, IpcStream};

/// Connected, authenticated IPC client.
pub struct IpcClient {
    reader: BufReader<ReadHalf<IpcStream>>,
    writer: WriteHalf<IpcStream>,
    server_version: String,
}

impl IpcClient {
    /// Connect to an endpoint and authenticate with `token`.
    pub async fn connect(endpoint: &EndpointInfo, token: &str) -> Result<Self, IpcError> {
        let stream = transport::connect(endpoint)
            .await
            .map_err(|e| IpcError::from_io_error("connecting", e))?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let hello = ClientHello {
            token: token.to_string(),
            client_name: None,
        };
        let encoded =
            encode(&hello).map_err(|e| IpcError::InvalidMessage(format!("encode hello: {e}")))?;
        write_half
            .write_all(encoded.as_bytes())
            .await
            .map_err(|e| IpcError::from_io_error("sending hello", e))?;
        write_half
            .flush()
            .await
            .map_err(|e| IpcError::from_io_error("flushing hello", e))?;

        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| IpcError::from_io_error("reading hello ack", e))?;
        let ack: HelloAck =
            decode(&line).map_err(|e| IpcError::InvalidMessage(format!("hello ack: {e}")))?;
        if !ack.ok {
            debug!(
                "Hello rejected: {:?} {:?}",
                ack.error_code, ack.message
            );
            return Err(IpcError::AuthFailed);
        }

        Ok(Self {
            reader,
            writer: write_half,
            server_version: ack.server_version,
        })
    }

    /// Connect using the endpoint and token published in the per-user
    /// runtime directory.
    pub async fn connect_from_runtime_dir() -> Result<Self, IpcError> {
        let (endpoint, token) = read_runtime_files(&paths::endpoint_path(), &paths::token_path())?;
        Self::connect(&endpoint, &token).await
    }

    /// Version the daemon reported in its hello ack.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Send one request and await its response.
    pub async fn request(&mut self, request: CoreRequest) -> Result<CoreResponse, IpcError> {
        let encoded = encode(&request)
            .map_err(|e| IpcError::InvalidMessage(format!("encode request: {e}")))?;
        self.writer
            .write_all(encoded.as_bytes())
            .await
            .map_err(|e| IpcError::from_io_error("sending request", e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| IpcError::from_io_error("flushing request", e))?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| IpcError::from_io_error("reading response", e))?;
        if read == 0 {
            return Err(IpcError::from_io_error(
                "reading response",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
            ));
        }
        decode(&line).map_err(|e| IpcError::InvalidMessage(format!("decode response: {e}")))
    }
}

/// Read endpoint + token files written by a running daemon.
pub fn read_runtime_files(
    endpoint_path: &Path,
    token_path: &Path,
) -> Result<(EndpointInfo, String), IpcError> {
    let endpoint_raw = std::fs::read_to_string(endpoint_path).map_err(|e| {
        IpcError::from_io_error("reading endpoint file (is the core running?)", e)
    })?;
    let endpoint: EndpointInfo = serde_json::from_str(&endpoint_raw)
        .map_err(|e| IpcError::InvalidMessage(format!("endpoint file: {e}")))?;
    let token = std::fs::read_to_string(token_path)
        .map_err(|e| IpcError::from_io_error("reading token file", e))?
        .trim()
        .to_string();
    Ok((endpoint, token))
}

/// Whether an error code indicates the client should refresh its runtime
/// files and retry once.
pub fn should_refresh_and_retry(code: &str) -> bool {
    code == codes::AUTH_STALE_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_runtime_files() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint_path = dir.path().join("core.endpoint");
        let token_path = dir.path().join("core.token");
        std::fs::write(
            &endpoint_path,
            r#"{"transport":"tcp","address":"127.0.0.1","port":4242}"#,
        )
        .unwrap();
        std::fs::write(&token_path, "sekrit\n").unwrap();

        let (endpoint, token) = read_runtime_files(&endpoint_path, &token_path).unwrap();
        assert_eq!(endpoint.transport, "tcp");
        assert_eq!(endpoint.port, Some(4242));
        assert_eq!(token, "sekrit");
    }

    #[test]
    fn test_read_runtime_files_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_runtime_files(
            &dir.path().join("core.endpoint"),
            &dir.path().join("core.token"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_should_refresh_and_retry() {
        assert!(should_refresh_and_retry("AUTH_STALE_TOKEN"));
        assert!(!should_refresh_and_retry("NOT_FOUND"));
    }
}
