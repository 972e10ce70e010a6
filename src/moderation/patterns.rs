//! Local blocklist for child sexual abuse material requests (English + French).

use std::sync::LazyLock;

use regex::RegexSet;

const PATTERNS: &[&str] = &[
    r"(?i)\bcsam\b",
    r"(?i)\bcsem\b",
    r"(?i)\bchild\s+sexual\s+abuse\s+material\b",
    r"(?i)\bchild\s+porn(?:ography)?\b",
    r"(?i)\bpedoporn(?:ography|ographique)?\b",
    r"(?i)\blolicon\b",
    r"(?i)\bshotacon\b",
    r"(?i)\bunderage\s+(?:porn|sex|sexual|naked|nude)\b",
    r"(?i)\bpreteens?\s+(?:porn|sex|sexual|naked|nude)\b",
    r"(?i)\b(?:child|kid|enfant|mineur)\s+(?:porn|sex|sexual|naked|nude|fuck|rape)\b",
    r"(?i)\b(?:enfant|fillette|gar(?:c|ç)onnet|mineur)\s+(?:sexuel|sexuelle|viol|baise)\b",
];

static BLOCKLIST: LazyLock<RegexSet> =
    LazyLock::new(|| RegexSet::new(PATTERNS).expect("static blocklist patterns are valid"));

/// True if any blocklist pattern matches the prompt.
pub fn is_blocked_prompt(prompt: &str) -> bool {
    !prompt.is_empty() && BLOCKLIST.is_match(prompt)
}
