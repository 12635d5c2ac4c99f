//! Heuristic token estimation and recency-first budget selection.
//!
//! No exact tokenizer: text is classified as wide-script, code-like, or
//! prose, and a chars-per-token ratio is applied. Exactness was traded for
//! avoiding a tokenizer dependency; the estimator is a trait so exact
//! model parity can be plugged in.

use std::sync::Arc;

use arbor_core::text::clamp_to_boundary;
use arbor_core::{ContextEntry, Role};

/// Fixed per-message formatting overhead, in tokens.
const MESSAGE_OVERHEAD: u32 = 4;

/// Chars per token for wide (CJK-style) script.
const WIDE_CHARS_PER_TOKEN: f64 = 1.7;
/// Chars per token for code-like text.
const CODE_CHARS_PER_TOKEN: f64 = 3.0;
/// Chars per token for plain prose.
const PROSE_CHARS_PER_TOKEN: f64 = 4.0;

/// Share of wide-script chars above which text counts as wide.
const WIDE_RATIO_THRESHOLD: f64 = 0.3;
/// Share of code punctuation above which text counts as code.
const CODE_DENSITY_THRESHOLD: f64 = 0.08;

/// Token-count estimation strategy.
pub trait TokenEstimator: Send + Sync {
    /// Estimated tokens for raw text.
    fn estimate_text(&self, text: &str) -> u32;

    /// Estimated tokens for a chat entry: text plus formatting overhead.
    fn estimate_entry(&self, entry: &ContextEntry) -> u32 {
        self.estimate_text(&entry.content) + MESSAGE_OVERHEAD + role_overhead(entry.role)
    }
}

fn role_overhead(role: Role) -> u32 {
    match role {
        Role::System => 2,
        Role::User | Role::Assistant => 1,
    }
}

/// Default estimator: per-script chars-per-token ratios.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicEstimator;

impl HeuristicEstimator {
    fn chars_per_token(text: &str) -> f64 {
        let total = text.chars().count();
        if total == 0 {
            return PROSE_CHARS_PER_TOKEN;
        }
        let wide = text.chars().filter(|c| is_wide(*c)).count();
        if wide as f64 / total as f64 >= WIDE_RATIO_THRESHOLD {
            return WIDE_CHARS_PER_TOKEN;
        }
        let code = text.chars().filter(|c| is_code_punct(*c)).count();
        if code as f64 / total as f64 >= CODE_DENSITY_THRESHOLD {
            return CODE_CHARS_PER_TOKEN;
        }
        PROSE_CHARS_PER_TOKEN
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate_text(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f64;
        (chars / Self::chars_per_token(text)).ceil() as u32
    }
}

/// CJK and related full-width ranges.
fn is_wide(c: char) -> bool {
    matches!(c,
        '\u{1100}'..='\u{11FF}'   // Hangul Jamo
        | '\u{2E80}'..='\u{9FFF}' // CJK radicals through unified ideographs
        | '\u{AC00}'..='\u{D7AF}' // Hangul syllables
        | '\u{F900}'..='\u{FAFF}' // CJK compatibility ideographs
        | '\u{FF00}'..='\u{FFEF}' // full-width forms
    )
}

fn is_code_punct(c: char) -> bool {
    matches!(
        c,
        '{' | '}' | '[' | ']' | '(' | ')' | '<' | '>' | ';' | '=' | '&' | '|' | '`' | '_' | '/'
    )
}

/// Entries kept by a budget pass.
#[derive(Clone, Debug)]
pub struct BudgetSelection {
    /// Surviving entries, chronological order restored.
    pub entries: Vec<ContextEntry>,
    /// Indices of the survivors in the input slice, ascending.
    pub kept_indices: Vec<usize>,
    /// Estimated token total of the survivors.
    pub total_tokens: u32,
    /// How many input entries were dropped.
    pub dropped: usize,
}

/// Applies a token ceiling to candidate entry lists, newest first.
pub struct TokenBudget {
    estimator: Arc<dyn TokenEstimator>,
}

impl TokenBudget {
    /// Create a budget manager over `estimator`.
    #[must_use]
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// The underlying estimator.
    #[must_use]
    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Select entries from `candidates` (oldest first) under `max_tokens`.
    ///
    /// Walks from the most recent entry backward and stops at the first
    /// entry that would overflow; nothing older is skipped over, so the
    /// result is always a contiguous recent suffix. Output order is
    /// chronological again.
    #[must_use]
    pub fn select_within(&self, candidates: &[ContextEntry], max_tokens: u32) -> BudgetSelection {
        let mut kept_indices = Vec::new();
        let mut total_tokens = 0u32;

        for (index, entry) in candidates.iter().enumerate().rev() {
            let cost = self.estimator.estimate_entry(entry);
            if total_tokens + cost > max_tokens {
                break;
            }
            total_tokens += cost;
            kept_indices.push(index);
        }
        kept_indices.reverse();

        let entries = kept_indices
            .iter()
            .map(|&i| candidates[i].clone())
            .collect();
        BudgetSelection {
            entries,
            dropped: candidates.len() - kept_indices.len(),
            kept_indices,
            total_tokens,
        }
    }

    /// Longest prefix of `text` estimated at no more than `max_tokens`,
    /// found by binary search over byte length, snapped to char
    /// boundaries.
    #[must_use]
    pub fn truncate_to_tokens<'a>(&self, text: &'a str, max_tokens: u32) -> &'a str {
        if self.estimator.estimate_text(text) <= max_tokens {
            return text;
        }
        // Invariant: the boundary-snapped prefix at `lo` fits, the one at
        // `hi` does not.
        let mut lo = 0usize;
        let mut hi = text.len();
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if self.estimator.estimate_text(clamp_to_boundary(text, mid)) <= max_tokens {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        clamp_to_boundary(text, lo)
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicEstimator))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
