// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session bindings and capability profiles.
//!
//! The first request from a session id binds it to a profile and origin;
//! every later request is checked against the binding's allowlist. Some
//! bindings are pinned to a single task (pair workers): any request naming
//! a different task fails `SCOPE_DENIED`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::codes;
use crate::ipc::CoreRequest;

/// Named allowlist of (capability, method) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityProfile {
    Viewer,
    Planner,
    PairWorker,
    Operator,
    Maintainer,
}

impl CapabilityProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Planner => "planner",
            Self::PairWorker => "pair_worker",
            Self::Operator => "operator",
            Self::Maintainer => "maintainer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Self::Viewer),
            "planner" => Some(Self::Planner),
            "pair_worker" => Some(Self::PairWorker),
            "operator" => Some(Self::Operator),
            "maintainer" => Some(Self::Maintainer),
            _ => None,
        }
    }

    /// Whether this profile may call (capability, method).
    pub fn allows(self, capability: &str, method: &str) -> bool {
        match self {
            Self::Maintainer => true,
            Self::Operator => {
                // Everything short of settings mutation.
                !(capability == "settings" && method == "update")
            }
            Self::Viewer => Self::viewer_allows(capability, method),
            Self::Planner => {
                Self::viewer_allows(capability, method)
                    || matches!(
                        (capability, method),
                        ("plan", "propose")
                            | ("plan", "list")
                            | ("tasks", "create")
                            | ("tasks", "update_scratchpad")
                    )
            }
            Self::PairWorker => matches!(
                (capability, method),
                ("tasks", "get")
                    | ("tasks", "context")
                    | ("tasks", "scratchpad")
                    | ("tasks", "update_scratchpad")
                    | ("tasks", "logs")
                    | ("review", "request")
                    | ("sessions", "create")
                    | ("sessions", "exists")
                    | ("sessions", "kill")
                    | ("messages", "queue")
                    | ("messages", "status")
            ),
        }
    }

    fn viewer_allows(capability: &str, method: &str) -> bool {
        match capability {
            "tasks" => matches!(
                method,
                "get" | "list" | "context" | "scratchpad" | "logs" | "counts" | "search" | "wait"
            ),
            "projects" => matches!(method, "list" | "get"),
            "repos" => method == "list",
            "audit" => method == "tail",
            _ => false,
        }
    }
}

/// Where a session attaches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionOrigin {
    Tui,
    Mcp,
    Cli,
    Kagan,
    KaganAdmin,
}

impl SessionOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tui => "TUI",
            Self::Mcp => "MCP",
            Self::Cli => "CLI",
            Self::Kagan => "KAGAN",
            Self::KaganAdmin => "KAGAN_ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TUI" => Some(Self::Tui),
            "MCP" => Some(Self::Mcp),
            "CLI" => Some(Self::Cli),
            "KAGAN" => Some(Self::Kagan),
            "KAGAN_ADMIN" => Some(Self::KaganAdmin),
            _ => None,
        }
    }

    /// Origins that require an exact client/daemon version match.
    pub fn requires_version_match(self) -> bool {
        matches!(self, Self::Kagan | Self::KaganAdmin)
    }
}

/// One session's binding, fixed at first request.
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub profile: CapabilityProfile,
    pub origin: SessionOrigin,
    /// Pinned task id for task-scoped profiles.
    pub task_scope: Option<String>,
    pub namespace: String,
}

/// Error from binding registration or authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingError {
    pub code: &'static str,
    pub message: String,
}

impl BindingError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Registry of session id to binding.
#[derive(Default)]
pub struct SessionBindings {
    bindings: HashMap<String, SessionBinding>,
}

impl SessionBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the binding for a request, creating it on first contact.
    ///
    /// Unknown profile or origin strings are rejected rather than silently
    /// downgraded. A pair worker is pinned to the task named in its first
    /// request.
    pub fn get_or_bind(&mut self, request: &CoreRequest) -> Result<SessionBinding, BindingError> {
        if let Some(binding) = self.bindings.get(&request.session_id) {
            return Ok(binding.clone());
        }

        let profile = match request.session_profile.as_deref() {
            None => CapabilityProfile::Viewer,
            Some(raw) => CapabilityProfile::parse(raw).ok_or_else(|| {
                BindingError::new(
                    codes::INVALID_PARAMS,
                    format!("Unknown capability profile: {raw}"),
                )
            })?,
        };
        let origin = match request.session_origin.as_deref() {
            None => SessionOrigin::Cli,
            Some(raw) => SessionOrigin::parse(raw).ok_or_else(|| {
                BindingError::new(
                    codes::INVALID_PARAMS,
                    format!("Unknown session origin: {raw}"),
                )
            })?,
        };

        let task_scope = if profile == CapabilityProfile::PairWorker {
            match request_task_id(request) {
                Some(task_id) => Some(task_id),
                None => {
                    return Err(BindingError::new(
                        codes::SCOPE_DENIED,
                        "pair_worker sessions must name their task on first request",
                    ))
                }
            }
        } else {
            None
        };

        let binding = SessionBinding {
            profile,
            origin,
            task_scope,
            namespace: "core".to_string(),
        };
        self.bindings
            .insert(request.session_id.clone(), binding.clone());
        Ok(binding)
    }

    pub fn unbind(&mut self, session_id: &str) {
        self.bindings.remove(session_id);
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionBinding> {
        self.bindings.get(session_id)
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

/// Enforce the profile allowlist for a request.
pub fn enforce_profile(
    binding: &SessionBinding,
    capability: &str,
    method: &str,
) -> Result<(), BindingError> {
    if binding.profile.allows(capability, method) {
        return Ok(());
    }
    Err(BindingError::new(
        codes::ACTION_NOT_ALLOWED,
        format!(
            "Profile '{}' may not call {capability}.{method}",
            binding.profile.as_str()
        ),
    ))
}

/// Enforce a task-scoped binding: any request naming a different task is
/// denied.
pub fn enforce_task_scope(
    binding: &SessionBinding,
    request: &CoreRequest,
) -> Result<(), BindingError> {
    let Some(ref pinned) = binding.task_scope else {
        return Ok(());
    };
    let Some(requested) = request_task_id(request) else {
        return Ok(());
    };
    if &requested == pinned {
        return Ok(());
    }
    Err(BindingError::new(
        codes::SCOPE_DENIED,
        format!("Session is scoped to task {pinned}, not {requested}"),
    ))
}

fn request_task_id(request: &CoreRequest) -> Option<String> {
    request
        .params
        .get("task_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        session_id: &str,
        profile: Option<&str>,
        origin: Option<&str>,
        params: serde_json::Value,
    ) -> CoreRequest {
        CoreRequest {
            request_id: "r1".to_string(),
            session_id: session_id.to_string(),
            session_profile: profile.map(str::to_string),
            session_origin: origin.map(str::to_string),
            client_version: "0.1.0".to_string(),
            capability: "tasks".to_string(),
            method: "get".to_string(),
            params,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_first_request_binds_profile() {
        let mut bindings = SessionBindings::new();
        let binding = bindings
            .get_or_bind(&request("s1", Some("planner"), Some("MCP"), serde_json::json!({})))
            .unwrap();
        assert_eq!(binding.profile, CapabilityProfile::Planner);
        assert_eq!(binding.origin, SessionOrigin::Mcp);

        // A later request with a different claimed profile keeps the first
        // binding.
        let binding = bindings
            .get_or_bind(&request("s1", Some("maintainer"), None, serde_json::json!({})))
            .unwrap();
        assert_eq!(binding.profile, CapabilityProfile::Planner);
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let mut bindings = SessionBindings::new();
        let err = bindings
            .get_or_bind(&request("s1", Some("root"), None, serde_json::json!({})))
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[test]
    fn test_missing_fields_default_to_viewer_cli() {
        let mut bindings = SessionBindings::new();
        let binding = bindings
            .get_or_bind(&request("s1", None, None, serde_json::json!({})))
            .unwrap();
        assert_eq!(binding.profile, CapabilityProfile::Viewer);
        assert_eq!(binding.origin, SessionOrigin::Cli);
    }

    #[test]
    fn test_pair_worker_pinned_to_first_task() {
        let mut bindings = SessionBindings::new();
        let binding = bindings
            .get_or_bind(&request(
                "s1",
                Some("pair_worker"),
                None,
                serde_json::json!({"task_id": "t1"}),
            ))
            .unwrap();
        assert_eq!(binding.task_scope.as_deref(), Some("t1"));

        // Same task passes scope; different task is denied.
        let same = request("s1", None, None, serde_json::json!({"task_id": "t1"}));
        assert!(enforce_task_scope(&binding, &same).is_ok());
        let other = request("s1", None, None, serde_json::json!({"task_id": "t2"}));
        let err = enforce_task_scope(&binding, &other).unwrap_err();
        assert_eq!(err.code, codes::SCOPE_DENIED);
    }

    #[test]
    fn test_pair_worker_without_task_rejected() {
        let mut bindings = SessionBindings::new();
        let err = bindings
            .get_or_bind(&request("s1", Some("pair_worker"), None, serde_json::json!({})))
            .unwrap_err();
        assert_eq!(err.code, codes::SCOPE_DENIED);
    }

    #[test]
    fn test_profile_allowlists() {
        use CapabilityProfile::*;
        assert!(Viewer.allows("tasks", "list"));
        assert!(!Viewer.allows("tasks", "create"));
        assert!(!Viewer.allows("settings", "update"));

        assert!(Planner.allows("tasks", "create"));
        assert!(Planner.allows("plan", "propose"));
        assert!(!Planner.allows("tasks", "delete"));

        assert!(PairWorker.allows("tasks", "update_scratchpad"));
        assert!(PairWorker.allows("review", "request"));
        assert!(!PairWorker.allows("tasks", "delete"));

        assert!(Operator.allows("tasks", "delete"));
        assert!(Operator.allows("settings", "get"));
        assert!(!Operator.allows("settings", "update"));

        assert!(Maintainer.allows("settings", "update"));
    }

    #[test]
    fn test_version_match_origins() {
        assert!(SessionOrigin::Kagan.requires_version_match());
        assert!(SessionOrigin::KaganAdmin.requires_version_match());
        assert!(!SessionOrigin::Mcp.requires_version_match());
        assert!(!SessionOrigin::Tui.requires_version_match());
    }

    #[test]
    fn test_unbind() {
        let mut bindings = SessionBindings::new();
        bindings
            .get_or_bind(&request("s1", Some("operator"), None, serde_json::json!({})))
            .unwrap();
        assert!(bindings.get("s1").is_some());
        bindings.unbind("s1");
        assert!(bindings.get("s1").is_none());
    }
}
