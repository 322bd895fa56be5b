//! Conversation memory windowing.
//!
//! [`build_window`] picks the longest recent suffix of a conversation that
//! fits a token budget, after reserving room for an optional rolling
//! summary. The newest `min_recent_turns` turns are always kept, even when
//! that pushes the window past its budget.
//!
//! Tokens are estimated as `⌈chars / 4⌉`. The function is pure: no I/O,
//! no clock, no hidden state.

use crate::models::{ConversationTurn, WindowResult};

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed limits applied on every window build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Sub-budget the rolling summary may consume.
    pub summary_token_cap: usize,
    /// Newest turns kept regardless of budget.
    pub min_recent_turns: usize,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            summary_token_cap: 500,
            min_recent_turns: 3,
        }
    }
}

/// `⌈chars / 4⌉`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub fn turn_cost(turn: &ConversationTurn) -> usize {
    estimate_tokens(&turn.user_message) + estimate_tokens(&turn.agent_response)
}

/// Select the turns and summary that go into one prompt.
///
/// `turns` must be ordered oldest first. The returned turns are a
/// contiguous suffix of `turns`, still oldest first.
pub fn build_window(
    turns: &[ConversationTurn],
    summary: Option<&str>,
    max_tokens: usize,
    policy: &WindowPolicy,
) -> WindowResult {
    let (summary_included, summary_tokens, summary_truncated) =
        match summary.filter(|s| !s.is_empty()) {
            None => (None, 0, false),
            Some(s) => {
                let estimate = estimate_tokens(s);
                if estimate > policy.summary_token_cap {
                    let cut: String = s
                        .chars()
                        .take(policy.summary_token_cap * CHARS_PER_TOKEN)
                        .collect();
                    (Some(cut), policy.summary_token_cap, true)
                } else {
                    (Some(s.to_string()), estimate, false)
                }
            }
        };

    let available = max_tokens.saturating_sub(summary_tokens);

    let mut running = 0usize;
    let mut accepted = 0usize;
    for turn in turns.iter().rev() {
        let cost = turn_cost(turn);
        if accepted < policy.min_recent_turns || running + cost <= available {
            running += cost;
            accepted += 1;
        } else {
            // Every older turn is rejected too, keeping the selection a suffix.
            break;
        }
    }

    let start = turns.len() - accepted;
    let tokens_used = running + summary_tokens;

    WindowResult {
        selected_turns: turns[start..].to_vec(),
        tokens_used,
        trimmed_count: start,
        summary_included,
        summary_tokens,
        summary_truncated,
        max_tokens,
        over_budget: tokens_used > max_tokens,
    }
}
