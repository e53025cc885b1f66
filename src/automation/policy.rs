// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pure scheduling policy: stop rules, capacity, and conflict assessment.
//!
//! Conflict detection is deterministic and text-only. Hints are derived
//! from a task's title, description, and acceptance criteria: path-like
//! tokens, file-like tokens, and a small keyword map. A candidate is
//! blocked iff its hint set intersects a running task's hint set; a task
//! with no hints never blocks and is never blocked.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::models::{Task, TaskStatus, TaskType};

static PATH_HINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_.-]+(?:/[A-Za-z0-9_.-]+)+").expect("path hint regex"));
static FILE_HINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_.-]+\.[A-Za-z0-9]{1,8}").expect("file hint regex"));
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+").expect("word regex"));

const KEYWORD_HINTS: [(&str, &str); 8] = [
    ("test", "tests/**"),
    ("tests", "tests/**"),
    ("pytest", "tests/**"),
    ("readme", "README.md"),
    ("docs", "docs/**"),
    ("config", "config/**"),
    ("docker", "Dockerfile"),
    ("cargo", "Cargo.toml"),
];

/// Conflict decision for a candidate spawn against the running set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConflictAssessment {
    pub blocker_task_ids: Vec<String>,
    pub overlap_hints: Vec<String>,
}

impl ConflictAssessment {
    pub fn is_blocked(&self) -> bool {
        !self.blocker_task_ids.is_empty()
    }
}

/// Whether a running AUTO task must be stopped on this status transition.
/// REVIEW transitions are part of the normal completion flow and never
/// stop the agent.
pub fn should_stop_running_on_status_change(
    old_status: Option<TaskStatus>,
    new_status: Option<TaskStatus>,
) -> bool {
    match old_status {
        Some(TaskStatus::InProgress) | Some(TaskStatus::Review) => {
            new_status != Some(TaskStatus::Review)
        }
        _ => false,
    }
}

/// Whether the scheduler has capacity for another AUTO agent.
pub fn can_spawn_new_agent(running_count: usize, max_agents: usize) -> bool {
    running_count < max_agents
}

pub fn is_auto_task(task_type: TaskType) -> bool {
    task_type == TaskType::Auto
}

/// Derive the sorted, deduplicated conflict hint set for a task.
pub fn derive_conflict_hints(task: &Task) -> Vec<String> {
    let joined = [
        task.title.trim(),
        task.description.trim(),
        &task.acceptance_criteria.join(" "),
    ]
    .iter()
    .filter(|part| !part.trim().is_empty())
    .map(|part| part.trim())
    .collect::<Vec<_>>()
    .join("\n");
    if joined.is_empty() {
        return Vec::new();
    }

    let normalized = joined.replace('`', " ");
    let mut hints: BTreeSet<String> = BTreeSet::new();

    for m in PATH_HINT_RE.find_iter(&normalized) {
        hints.insert(m.as_str().trim_matches(['.', '/']).to_string());
    }
    for m in FILE_HINT_RE.find_iter(&normalized) {
        hints.insert(m.as_str().trim_matches(['.', '/']).to_string());
    }
    for m in WORD_RE.find_iter(&normalized) {
        let word = m.as_str().to_lowercase();
        if let Some((_, hint)) = KEYWORD_HINTS.iter().find(|(k, _)| *k == word) {
            hints.insert((*hint).to_string());
        }
    }

    hints.into_iter().collect()
}

/// Assess whether `candidate` is blocked by any of `running`.
pub fn assess_conflict(candidate: &Task, running: &[(String, Task)]) -> ConflictAssessment {
    if running.is_empty() {
        return ConflictAssessment::default();
    }
    let candidate_hints: BTreeSet<String> = derive_conflict_hints(candidate).into_iter().collect();
    if candidate_hints.is_empty() {
        return ConflictAssessment::default();
    }

    let mut blockers = Vec::new();
    let mut overlaps: BTreeSet<String> = BTreeSet::new();
    for (task_id, running_task) in running {
        let running_hints: BTreeSet<String> =
            derive_conflict_hints(running_task).into_iter().collect();
        let overlap: Vec<&String> = candidate_hints.intersection(&running_hints).collect();
        if overlap.is_empty() {
            continue;
        }
        blockers.push(task_id.clone());
        overlaps.extend(overlap.into_iter().cloned());
    }

    ConflictAssessment {
        blocker_task_ids: blockers,
        overlap_hints: overlaps.into_iter().collect(),
    }
}

/// Scope an agent runs under, deciding its auto-approve policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPermissionScope {
    /// Implementation agent driven by the engine: full auto-approve.
    AutomationRunner,
    /// Read-only review agent: auto-approve (it cannot mutate).
    AutomationReviewer,
    /// Planner agents follow the user's configured policy.
    Planner,
}

pub fn resolve_auto_approve(scope: AgentPermissionScope, planner_auto_approve: bool) -> bool {
    match scope {
        AgentPermissionScope::AutomationRunner | AgentPermissionScope::AutomationReviewer => true,
        AgentPermissionScope::Planner => planner_auto_approve,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(title: &str, description: &str) -> Task {
        let mut task = Task::new("p1", title);
        task.description = description.to_string();
        task
    }

    #[test]
    fn test_stop_policy() {
        use TaskStatus::*;
        assert!(should_stop_running_on_status_change(
            Some(InProgress),
            Some(Backlog)
        ));
        assert!(should_stop_running_on_status_change(Some(InProgress), None));
        assert!(!should_stop_running_on_status_change(
            Some(InProgress),
            Some(Review)
        ));
        assert!(should_stop_running_on_status_change(Some(Review), Some(Done)));
        assert!(!should_stop_running_on_status_change(
            Some(Review),
            Some(Review)
        ));
        assert!(!should_stop_running_on_status_change(
            Some(Backlog),
            Some(InProgress)
        ));
    }

    #[test]
    fn test_capacity() {
        assert!(can_spawn_new_agent(0, 2));
        assert!(can_spawn_new_agent(1, 2));
        assert!(!can_spawn_new_agent(2, 2));
    }

    #[test]
    fn test_hints_extract_paths_and_files() {
        let hints = derive_conflict_hints(&task(
            "Fix calculator",
            "The bug lives in `src/calculator.py` near utils.rs",
        ));
        assert!(hints.contains(&"src/calculator.py".to_string()));
        assert!(hints.contains(&"utils.rs".to_string()));
    }

    #[test]
    fn test_hints_keyword_map() {
        let hints = derive_conflict_hints(&task("Update README and docs", ""));
        assert!(hints.contains(&"README.md".to_string()));
        assert!(hints.contains(&"docs/**".to_string()));

        let hints = derive_conflict_hints(&task("Add tests for login", ""));
        assert!(hints.contains(&"tests/**".to_string()));
    }

    #[test]
    fn test_hints_from_acceptance_criteria() {
        let mut t = task("Vague title", "");
        t.acceptance_criteria = vec!["touch src/api/router.py".to_string()];
        let hints = derive_conflict_hints(&t);
        assert!(hints.contains(&"src/api/router.py".to_string()));
    }

    #[test]
    fn test_hints_empty_for_plain_text() {
        // No paths, no dotted files, no keywords.
        let hints = derive_conflict_hints(&task("Improve onboarding flow", "make it smoother"));
        assert!(hints.is_empty());
    }

    #[test]
    fn test_conflict_blocked_on_overlap() {
        let candidate = task("Touch calculator", "edit src/calculator.py");
        let running = vec![(
        "aaaa1111".to_string(),
            task("Other calculator work", "also src/calculator.py"),
        )];
        let assessment = assess_conflict(&candidate, &running);
        assert!(assessment.is_blocked());
        assert_eq!(assessment.blocker_task_ids, vec!["aaaa1111"]);
        assert_eq!(assessment.overlap_hints, vec!["src/calculator.py"]);
    }

    #[test]
    fn test_conflict_not_blocked_without_overlap() {
        let candidate = task("Frontend", "edit web/app.tsx");
        let running = vec![("x".to_string(), task("Backend", "edit src/server.py"))];
        assert!(!assess_conflict(&candidate, &running).is_blocked());
    }

    #[test]
    fn test_conflict_hintless_sides_never_block() {
        let hintless = task("Vague work", "do things");
        let hinted = task("Specific", "src/a.py");
        assert!(!assess_conflict(&hintless, &[("x".to_string(), hinted.clone())]).is_blocked());
        assert!(!assess_conflict(&hinted, &[("x".to_string(), hintless)]).is_blocked());
    }

    #[test]
    fn test_conflict_matches_derivation_equivalence() {
        // blocked iff hint sets intersect.
        let a = task("One", "src/shared.py plus tests");
        let b = task("Two", "rework tests entirely");
        let a_hints: std::collections::BTreeSet<_> =
            derive_conflict_hints(&a).into_iter().collect();
        let b_hints: std::collections::BTreeSet<_> =
            derive_conflict_hints(&b).into_iter().collect();
        let expect_blocked = !a_hints.is_disjoint(&b_hints);
        let assessment = assess_conflict(&a, &[("b".to_string(), b)]);
        assert_eq!(assessment.is_blocked(), expect_blocked);
    }

    #[test]
    fn test_auto_approve_scopes() {
        assert!(resolve_auto_approve(
            AgentPermissionScope::AutomationRunner,
            false
        ));
        assert!(resolve_auto_approve(
            AgentPermissionScope::AutomationReviewer,
            false
        ));
        assert!(!resolve_auto_approve(AgentPermissionScope::Planner, false));
        assert!(resolve_auto_approve(AgentPermissionScope::Planner, true));
    }
}
