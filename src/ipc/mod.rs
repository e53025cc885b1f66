// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local IPC between the core daemon and its clients (TUI, MCP server,
//! CLI): newline-delimited JSON over a unix socket, with a loopback TCP
//! fallback.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::IpcClient;
pub use protocol::{ClientHello, CoreErrorPayload, CoreRequest, CoreResponse, HelloAck};
pub use server::{IpcServer, RequestHandler};
pub use transport::EndpointInfo;
