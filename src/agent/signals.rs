// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signal tags embedded in agent responses.
//!
//! Agents communicate verdicts inline as pseudo-XML, one tag per response:
//!
//! ```text
//! <complete reason="implemented"/>
//! <blocked reason="missing credentials"/>
//! <approve reason="looks good"/>
//! <reject reason="tests missing"/>
//! ```
//!
//! The scan is line-oriented and tolerant: the first recognised tag wins,
//! attributes are optional, and a response without any tag yields
//! [`Signal::None`].

use once_cell::sync::Lazy;
use regex::Regex;

/// Verdict encoded by an agent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Complete,
    Blocked,
    Approve,
    Reject,
    None,
}

/// A parsed signal plus its captured reason (may be empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalResult {
    pub signal: Signal,
    pub reason: String,
}

impl SignalResult {
    fn new(signal: Signal, reason: impl Into<String>) -> Self {
        Self {
            signal,
            reason: reason.into(),
        }
    }
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"<(complete|blocked|approve|reject)\b(?:[^>]*?reason\s*=\s*"([^"]*)")?[^>]*/\s*>"#,
    )
    .expect("signal tag regex")
});

/// Scan `response` for the first signal tag.
pub fn parse_signal(response: &str) -> SignalResult {
    for line in response.lines() {
        if let Some(captures) = TAG_RE.captures(line) {
            let reason = captures
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let signal = match &captures[1] {
                "complete" => Signal::Complete,
                "blocked" => Signal::Blocked,
                "approve" => Signal::Approve,
                "reject" => Signal::Reject,
                _ => unreachable!("regex alternation"),
            };
            return SignalResult::new(signal, reason);
        }
    }
    SignalResult::new(Signal::None, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_with_reason() {
        let result = parse_signal("all done\n<complete reason=\"implemented\"/>\n");
        assert_eq!(result.signal, Signal::Complete);
        assert_eq!(result.reason, "implemented");
    }

    #[test]
    fn test_blocked_reason_captured_verbatim() {
        let result = parse_signal("<blocked reason=\"Agent failed to start\"/>");
        assert_eq!(result.signal, Signal::Blocked);
        assert_eq!(result.reason, "Agent failed to start");
    }

    #[test]
    fn test_tag_without_reason() {
        let result = parse_signal("done <complete/>");
        assert_eq!(result.signal, Signal::Complete);
        assert_eq!(result.reason, "");
    }

    #[test]
    fn test_tag_with_spaced_close() {
        let result = parse_signal("<approve reason=\"ok\" />");
        assert_eq!(result.signal, Signal::Approve);
        assert_eq!(result.reason, "ok");
    }

    #[test]
    fn test_no_tag_yields_none() {
        let result = parse_signal("I made some progress but have more to do.");
        assert_eq!(result.signal, Signal::None);
        assert_eq!(result.reason, "");
    }

    #[test]
    fn test_first_tag_wins() {
        let result = parse_signal("<reject reason=\"no\"/>\n<approve reason=\"yes\"/>");
        assert_eq!(result.signal, Signal::Reject);
        assert_eq!(result.reason, "no");
    }

    #[test]
    fn test_reject_mid_prose() {
        let result =
            parse_signal("The tests fail. <reject reason=\"tests missing\"/> Please fix.");
        assert_eq!(result.signal, Signal::Reject);
        assert_eq!(result.reason, "tests missing");
    }
}
