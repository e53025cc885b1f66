// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plugin dispatch contract.
//!
//! Plugins contribute (capability, method) operations that are consulted
//! when the static dispatch map has no entry, and policy hooks that can
//! override the profile allowlist for the pairs they claim. Only the
//! contract lives in the core; concrete plugins register at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::host::binding::CapabilityProfile;

use super::dispatch::Handler;

/// One plugin-provided operation.
pub struct PluginOperation {
    pub capability: String,
    pub method: String,
    /// Mutating operations participate in the idempotency cache.
    pub mutating: bool,
    pub handler: Handler,
}

/// A plugin's authorization verdict for a request.
#[derive(Debug, Clone)]
pub struct PluginPolicyDecision {
    pub allowed: bool,
    pub code: String,
    pub message: String,
}

impl PluginPolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            code: String::new(),
            message: String::new(),
        }
    }

    pub fn deny(code: &str, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Policy hook: returns `Some` to claim the (capability, method) pair,
/// `None` to fall through to the profile allowlist.
pub type PolicyHook = Arc<
    dyn Fn(&str, &str, &str, CapabilityProfile, &serde_json::Value) -> Option<PluginPolicyDecision>
        + Send
        + Sync,
>;

/// Registry of plugin operations and policy hooks.
#[derive(Default)]
pub struct PluginRegistry {
    operations: HashMap<(String, String), PluginOperation>,
    policy_hooks: Vec<PolicyHook>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_operation(&mut self, operation: PluginOperation) {
        self.operations.insert(
            (operation.capability.clone(), operation.method.clone()),
            operation,
        );
    }

    pub fn register_policy_hook(&mut self, hook: PolicyHook) {
        self.policy_hooks.push(hook);
    }

    pub fn resolve_operation(&self, capability: &str, method: &str) -> Option<&PluginOperation> {
        self.operations
            .get(&(capability.to_string(), method.to_string()))
    }

    /// First hook claiming the pair wins; `None` means no plugin policy
    /// applies.
    pub fn evaluate_policy(
        &self,
        capability: &str,
        method: &str,
        session_id: &str,
        profile: CapabilityProfile,
        params: &serde_json::Value,
    ) -> Option<PluginPolicyDecision> {
        for hook in &self.policy_hooks {
            if let Some(decision) = hook(capability, method, session_id, profile, params) {
                return Some(decision);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    fn noop_handler() -> Handler {
        Arc::new(|_api, _params| {
            Box::pin(async move { Ok(serde_json::json!({"plugin": true})) })
        })
    }

    #[test]
    fn test_operation_resolution() {
        let mut registry = PluginRegistry::new();
        assert!(registry.resolve_operation("github", "pr_status").is_none());

        registry.register_operation(PluginOperation {
            capability: "github".to_string(),
            method: "pr_status".to_string(),
            mutating: false,
            handler: noop_handler(),
        });
        let operation = registry.resolve_operation("github", "pr_status").unwrap();
        assert!(!operation.mutating);
    }

    #[test]
    fn test_policy_hook_first_claim_wins() {
        let mut registry = PluginRegistry::new();
        registry.register_policy_hook(Arc::new(|capability, _m, _s, _p, _params| {
            (capability == "github")
                .then(|| PluginPolicyDecision::deny(codes::ACTION_NOT_ALLOWED, "no github"))
        }));
        registry.register_policy_hook(Arc::new(|capability, _m, _s, _p, _params| {
            (capability == "github").then(PluginPolicyDecision::allow)
        }));

        let decision = registry
            .evaluate_policy(
                "github",
                "pr_status",
                "s1",
                CapabilityProfile::Operator,
                &serde_json::Value::Null,
            )
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.code, codes::ACTION_NOT_ALLOWED);

        assert!(registry
            .evaluate_policy(
                "tasks",
                "get",
                "s1",
                CapabilityProfile::Viewer,
                &serde_json::Value::Null
            )
            .is_none());
    }
}
