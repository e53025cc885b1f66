// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Operational limits and timing constants shared across subsystems.

use std::time::Duration;

/// Maximum time to wait for an agent subprocess to report ready.
pub const AGENT_TIMEOUT_LONG: Duration = Duration::from_secs(120);

/// Interval for draining buffered agent messages into the execution log.
pub const STREAM_LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Trailing bytes of scratchpad content retained on write.
pub const SCRATCHPAD_LIMIT: usize = 100_000;

/// Cap applied to queued-message payloads appended to prompts (keep tail).
pub const QUEUE_PAYLOAD_LIMIT: usize = 8_192;

/// Trailing bytes of an agent response recorded as a run progress note.
pub const RUN_NOTE_TAIL: usize = 2_000;

/// Bound on the per-session idempotency cache.
pub const IDEMPOTENCY_CACHE_LIMIT: usize = 512;

/// Interval between lease heartbeat writes.
pub const LEASE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Age after which a lease heartbeat is considered stale.
pub const LEASE_STALE_AFTER: Duration = Duration::from_secs(15);

/// TTL for cached diff-family query results.
pub const DIFF_CACHE_TTL: Duration = Duration::from_secs(5);

/// Server-side ceiling for long-poll timeouts (`tasks_wait`, `wait_job`).
pub const WAIT_TIMEOUT_MAX: Duration = Duration::from_secs(300);

/// Truncate a queued-message payload to the trailing [`QUEUE_PAYLOAD_LIMIT`]
/// bytes, prefixing a marker when content was dropped.
pub fn truncate_queue_payload(content: &str) -> String {
    if content.len() <= QUEUE_PAYLOAD_LIMIT {
        return content.to_string();
    }
    let mut start = content.len() - QUEUE_PAYLOAD_LIMIT;
    while !content.is_char_boundary(start) {
        start += 1;
    }
    format!("[earlier content truncated]\n{}", &content[start..])
}

/// Keep the trailing `limit` bytes of `content` on a char boundary.
pub fn tail_bytes(content: &str, limit: usize) -> &str {
    if content.len() <= limit {
        return content;
    }
    let mut start = content.len() - limit;
    while !content.is_char_boundary(start) {
        start += 1;
    }
    &content[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_queue_payload_short() {
        assert_eq!(truncate_queue_payload("hello"), "hello");
    }

    #[test]
    fn test_truncate_queue_payload_long() {
        let content = "x".repeat(QUEUE_PAYLOAD_LIMIT + 100);
        let truncated = truncate_queue_payload(&content);
        assert!(truncated.starts_with("[earlier content truncated]\n"));
        assert!(truncated.ends_with('x'));
        assert_eq!(
            truncated.len(),
            "[earlier content truncated]\n".len() + QUEUE_PAYLOAD_LIMIT
        );
    }

    #[test]
    fn test_tail_bytes_char_boundary() {
        let content = format!("{}é", "a".repeat(10));
        // Request a cut that would land mid-codepoint; must advance past it.
        let tail = tail_bytes(&content, 1);
        assert!(tail.is_empty() || tail.chars().count() > 0);
        let tail = tail_bytes(&content, 2);
        assert_eq!(tail, "é");
    }
}
