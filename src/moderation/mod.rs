//! Prompt moderation gate.
//!
//! Every claimed prompt passes through [`ModerationFilter::evaluate`] before
//! it reaches the backend:
//! - `Disabled`: never blocks
//! - `Local`: blocklist regexes only
//! - `Remote`: blocklist first, then the remote classifier; any failure to
//!   obtain a classification blocks (fail closed)

mod openai;
mod patterns;

pub use openai::{MODERATION_TIMEOUT, OpenAiModeration};
pub use patterns::is_blocked_prompt;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::InferenceServer;
use crate::error::ModerationError;

/// Minimum characters kept when truncating without a tokenizer.
const FALLBACK_MIN_CHARS: usize = 200;
const FALLBACK_MIN_RATIO: f64 = 0.05;

/// How prompts are screened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationMode {
    Disabled,
    Local,
    Remote,
}

impl ModerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for ModerationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a positively classified prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositiveAction {
    /// Submit the configured safe response, tagged as censored.
    Respond,
    /// Submit a fault.
    Fault,
}

/// Why a prompt was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    RegexMatch,
    RemoteFlag,
    RemoteUnavailable,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegexMatch => "csam_regex",
            Self::RemoteFlag => "csam_openai",
            Self::RemoteUnavailable => "csam_openai_unavailable",
        }
    }

    /// A positive classification, as opposed to a failure to classify.
    pub fn is_positive(&self) -> bool {
        !matches!(self, Self::RemoteUnavailable)
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationDecision {
    pub blocked: bool,
    pub reason: Option<BlockReason>,
    pub mode: ModerationMode,
    /// Remote minors-category score, when a classification was obtained.
    pub remote_score: Option<f64>,
    /// Remote minors-category flag, when a classification was obtained.
    pub remote_flagged: Option<bool>,
}

impl ModerationDecision {
    fn clear(mode: ModerationMode) -> Self {
        Self {
            blocked: false,
            reason: None,
            mode,
            remote_score: None,
            remote_flagged: None,
        }
    }

    fn block(mode: ModerationMode, reason: BlockReason) -> Self {
        Self {
            blocked: true,
            reason: Some(reason),
            ..Self::clear(mode)
        }
    }

    /// Resolve the configured positive action for this decision.
    ///
    /// A prompt that could not be classified is always faulted: there is no
    /// finding to respond to.
    pub fn action(&self, policy: PositiveAction) -> PositiveAction {
        match self.reason {
            Some(reason) if reason.is_positive() => policy,
            _ => PositiveAction::Fault,
        }
    }
}

/// Result of a remote classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub flagged: bool,
    pub score: Option<f64>,
}

/// Remote content classifier.
#[async_trait]
pub trait ModerationClassifier: Send + Sync {
    async fn classify(&self, input: &str) -> Result<Classification, ModerationError>;
}

/// Text actually sent to the remote classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationInput {
    pub text: String,
    pub truncated: bool,
    pub estimated_tokens: usize,
    pub original_estimated_tokens: usize,
}

/// The moderation gate shared by all workers.
pub struct ModerationFilter {
    mode: ModerationMode,
    max_input_tokens: usize,
    classifier: Option<Arc<dyn ModerationClassifier>>,
}

impl ModerationFilter {
    pub fn new(
        mode: ModerationMode,
        max_input_tokens: u32,
        classifier: Option<Arc<dyn ModerationClassifier>>,
    ) -> Self {
        Self {
            mode,
            max_input_tokens: max_input_tokens.max(1) as usize,
            classifier,
        }
    }

    /// Decide whether a prompt may be generated.
    pub async fn evaluate(&self, prompt: &str, server: &InferenceServer) -> ModerationDecision {
        if self.mode == ModerationMode::Disabled {
            return ModerationDecision::clear(self.mode);
        }

        if is_blocked_prompt(prompt) {
            return ModerationDecision::block(ModerationMode::Local, BlockReason::RegexMatch);
        }

        if self.mode != ModerationMode::Remote {
            return ModerationDecision::clear(self.mode);
        }

        let Some(classifier) = &self.classifier else {
            warn!("Remote moderation enabled without a classifier");
            return ModerationDecision::block(self.mode, BlockReason::RemoteUnavailable);
        };

        let input = self.remote_input(prompt, server).await;
        if input.truncated {
            debug!(
                from_tokens = input.original_estimated_tokens,
                to_tokens = input.estimated_tokens,
                "Truncated prompt for remote moderation"
            );
        }

        match classifier.classify(&input.text).await {
            Ok(classification) => ModerationDecision {
                blocked: classification.flagged,
                reason: classification.flagged.then_some(BlockReason::RemoteFlag),
                mode: self.mode,
                remote_score: classification.score,
                remote_flagged: Some(classification.flagged),
            },
            Err(e) => {
                warn!(error = %e, "Remote moderation unavailable, blocking prompt");
                ModerationDecision::block(self.mode, BlockReason::RemoteUnavailable)
            }
        }
    }

    /// Fit the prompt into the classifier's token budget.
    ///
    /// Exact head truncation when the backend can tokenize, otherwise a
    /// proportional character cut that keeps at least 200 characters.
    pub async fn remote_input(&self, prompt: &str, server: &InferenceServer) -> ModerationInput {
        let max_tokens = self.max_input_tokens;
        let estimated = server.count_prompt_tokens(prompt).await;

        if estimated <= max_tokens {
            return ModerationInput {
                text: prompt.to_string(),
                truncated: false,
                estimated_tokens: estimated,
                original_estimated_tokens: estimated,
            };
        }

        if let Some(tokens) = server.tokenize(prompt).await
            && tokens.len() > max_tokens
            && let Some(text) = server.detokenize(&tokens[..max_tokens]).await
            && !text.is_empty()
        {
            return ModerationInput {
                text,
                truncated: true,
                estimated_tokens: max_tokens,
                original_estimated_tokens: tokens.len(),
            };
        }

        let ratio = (max_tokens as f64 / estimated as f64).clamp(FALLBACK_MIN_RATIO, 1.0);
        let char_count = prompt.chars().count();
        let keep = FALLBACK_MIN_CHARS.max((char_count as f64 * ratio).floor() as usize);

        ModerationInput {
            text: prompt.chars().take(keep).collect(),
            truncated: true,
            estimated_tokens: max_tokens,
            original_estimated_tokens: estimated,
        }
    }
}
