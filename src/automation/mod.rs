// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Automation engine: lifecycle orchestration for AUTO tasks.
//!
//! A single worker consumes status-change and spawn events sequentially, so
//! at most one spawn/stop decision is made per task per turn. Admission is
//! gated by the concurrency cap and by text-derived conflict hints; blocked
//! tasks wait in a side table and re-enter admission when their blockers
//! clear.

pub mod engine;
pub mod policy;
mod reviewer;

#[cfg(test)]
pub(crate) mod testutil;

pub use engine::AutomationEngine;
pub use policy::{
    assess_conflict, can_spawn_new_agent, derive_conflict_hints, resolve_auto_approve,
    should_stop_running_on_status_change, AgentPermissionScope, ConflictAssessment,
};
