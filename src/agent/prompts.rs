// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Prompt templates for implementation and review runs.
//!
//! Both builders are pure: same inputs, same text. The engine relies on
//! that, not on the exact wording.

use crate::store::models::Task;

/// Inputs for the implementation prompt.
pub struct PromptContext<'a> {
    pub task: &'a Task,
    pub run_count: i64,
    pub scratchpad: &'a str,
    pub user_name: &'a str,
    pub user_email: &'a str,
}

/// Build the prompt for an implementation run.
pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are working on task #{} for {} <{}>.\n\n",
        ctx.task.id, ctx.user_name, ctx.user_email
    ));
    out.push_str(&format!("# {}\n\n", ctx.task.title));
    if !ctx.task.description.is_empty() {
        out.push_str(&format!("{}\n\n", ctx.task.description));
    }

    if !ctx.task.acceptance_criteria.is_empty() {
        out.push_str("## Acceptance criteria\n");
        for criterion in &ctx.task.acceptance_criteria {
            out.push_str(&format!("- {criterion}\n"));
        }
        out.push('\n');
    }

    if ctx.run_count > 0 {
        out.push_str(&format!(
            "This is run {} for this task; earlier progress notes follow.\n\n",
            ctx.run_count + 1
        ));
    }
    if !ctx.scratchpad.is_empty() {
        out.push_str("## Notes so far\n");
        out.push_str(ctx.scratchpad);
        out.push_str("\n\n");
    }

    out.push_str(
        "Work in the current directory. Commit your changes as you go.\n\
         When the task is fully done, end your reply with <complete reason=\"...\"/>.\n\
         If you cannot proceed, end with <blocked reason=\"...\"/> explaining why.\n",
    );
    out
}

/// Inputs for the review prompt.
pub struct ReviewContext<'a> {
    pub task: &'a Task,
    pub commits: &'a [String],
    pub diff_summary: &'a str,
}

/// Build the prompt for a read-only review run.
pub fn get_review_prompt(ctx: &ReviewContext<'_>) -> String {
    let commits = if ctx.commits.is_empty() {
        "No commits".to_string()
    } else {
        ctx.commits
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let diff_summary = if ctx.diff_summary.is_empty() {
        "No changes"
    } else {
        ctx.diff_summary
    };

    format!(
        "Review the work done for task #{id}: {title}\n\n\
         ## Task description\n{description}\n\n\
         ## Commits\n{commits}\n\n\
         ## Diff summary\n{diff_summary}\n\n\
         Inspect the changes in the current directory (read-only). Judge whether\n\
         the task is complete and the changes are sound.\n\
         End your reply with <approve reason=\"...\"/> or <reject reason=\"...\"/>.\n",
        id = ctx.task.id,
        title = ctx.task.title,
        description = if ctx.task.description.is_empty() {
            "(none)"
        } else {
            &ctx.task.description
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        let mut task = Task::new("p1", "Fix login bug");
        task.description = "Users cannot log in with 2FA enabled.".to_string();
        task.acceptance_criteria = vec!["login works".to_string()];
        task
    }

    #[test]
    fn test_build_prompt_is_deterministic() {
        let task = task();
        let ctx = PromptContext {
            task: &task,
            run_count: 1,
            scratchpad: "--- Run 1 ---\ntried X",
            user_name: "Dev",
            user_email: "dev@localhost",
        };
        assert_eq!(build_prompt(&ctx), build_prompt(&ctx));
    }

    #[test]
    fn test_build_prompt_includes_task_material() {
        let task = task();
        let ctx = PromptContext {
            task: &task,
            run_count: 0,
            scratchpad: "",
            user_name: "Dev",
            user_email: "dev@localhost",
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("Fix login bug"));
        assert!(prompt.contains("2FA"));
        assert!(prompt.contains("- login works"));
        assert!(prompt.contains("<complete"));
        assert!(prompt.contains("<blocked"));
        // First run carries no progress preamble.
        assert!(!prompt.contains("Notes so far"));
    }

    #[test]
    fn test_review_prompt_handles_empty_inputs() {
        let task = task();
        let ctx = ReviewContext {
            task: &task,
            commits: &[],
            diff_summary: "",
        };
        let prompt = get_review_prompt(&ctx);
        assert!(prompt.contains("No commits"));
        assert!(prompt.contains("No changes"));
        assert!(prompt.contains("<approve"));
        assert!(prompt.contains("<reject"));
    }

    #[test]
    fn test_review_prompt_lists_commits() {
        let task = task();
        let commits = vec!["abc1234 fix 2fa flow".to_string()];
        let ctx = ReviewContext {
            task: &task,
            commits: &commits,
            diff_summary: "api: +10 -2 (1 files)",
        };
        let prompt = get_review_prompt(&ctx);
        assert!(prompt.contains("- abc1234 fix 2fa flow"));
        assert!(prompt.contains("api: +10 -2"));
    }
}
