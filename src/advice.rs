//! Suggestion types and the advice pipeline.
//!
//! [`AdvicePipeline::analyze`] is the only entry point. It consults the
//! configured strategy and always comes back with a suggestion for any
//! non-blank request: provider errors, timeouts and panics all end in the
//! local heuristics, and a failing heuristic ends in
//! [`Suggestion::monitoring`].

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AdviceSettings, PromptLimits};
use crate::heuristics;
use crate::provider::{AdviceProvider, HttpAdviceProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    ErrorHelp,
    NextStep,
    InstallHelp,
    LearningTip,
    General,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub title: String,
    pub message: String,
    /// A single command the student could run next.
    pub command: Option<String>,
    pub rationale: String,
}

impl Suggestion {
    /// The last-resort suggestion.
    pub fn monitoring() -> Self {
        Self {
            kind: SuggestionKind::General,
            title: "Assistant".to_string(),
            message: "I'm monitoring your terminal activity to help you learn.".to_string(),
            command: None,
            rationale: "Try --help or man pages to explore command options".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub command: String,
    pub had_error: bool,
}

/// Everything one analysis pass knows about recent activity.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub student_id: String,
    /// `None` when the command could not be attributed.
    pub command: Option<String>,
    pub output: String,
    pub error_output: String,
    /// Oldest first.
    pub history: Vec<HistoryEntry>,
    /// Set when the student asked something explicitly.
    pub question: Option<String>,
}

impl AnalysisRequest {
    fn is_blank(&self) -> bool {
        self.command.is_none()
            && self.question.is_none()
            && self.output.trim().is_empty()
            && self.error_output.trim().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum AdviceError {
    #[error("advice provider timed out")]
    Timeout,

    #[error("advice provider transport error: {0}")]
    Transport(String),

    #[error("advice provider returned unusable content: {0}")]
    Unusable(String),
}

/// Where suggestions come from. Chosen once, at construction.
#[derive(Clone)]
pub enum AdviceStrategy {
    External {
        name: String,
        provider: Arc<dyn AdviceProvider>,
    },
    Heuristic,
}

impl AdviceStrategy {
    /// An HTTP relay when an endpoint is configured, heuristics otherwise.
    pub fn from_settings(settings: &AdviceSettings) -> Result<Self, AdviceError> {
        match &settings.endpoint {
            Some(endpoint) => {
                let provider = HttpAdviceProvider::new(endpoint.clone(), settings.api_key.clone(), settings.timeout)?;
                Ok(AdviceStrategy::External {
                    name: settings.provider_name.clone(),
                    provider: Arc::new(provider),
                })
            }
            None => Ok(AdviceStrategy::Heuristic),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AdviceStrategy::External { .. } => "external",
            AdviceStrategy::Heuristic => "heuristic",
        }
    }

    pub fn provider_name(&self) -> Option<&str> {
        match self {
            AdviceStrategy::External { name, .. } => Some(name.as_str()),
            AdviceStrategy::Heuristic => None,
        }
    }
}

const SYSTEM_PROMPT: &str = "You are a terminal assistant in a cybersecurity teaching lab with tools such as \
nmap, john, metasploit and apache. Provide brief, practical suggestions only. Keep responses under 25 words. \
Focus on immediate fixes or next commands.";

pub struct AdvicePipeline {
    strategy: AdviceStrategy,
    timeout: Duration,
    limits: PromptLimits,
}

impl AdvicePipeline {
    pub fn new(strategy: AdviceStrategy, timeout: Duration, limits: PromptLimits) -> Self {
        Self {
            strategy,
            timeout,
            limits,
        }
    }

    pub fn heuristic() -> Self {
        let settings = AdviceSettings::default();
        Self::new(AdviceStrategy::Heuristic, settings.timeout, settings.limits)
    }

    pub fn strategy(&self) -> &AdviceStrategy {
        &self.strategy
    }

    /// Returns `None` only for a request with nothing in it.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Option<Suggestion> {
        if request.is_blank() {
            return None;
        }
        let suggestion = match &self.strategy {
            AdviceStrategy::External { name, provider } => match self.consult(provider.as_ref(), request).await {
                Ok(suggestion) => suggestion,
                Err(e) => {
                    warn!(provider = %name, student = %request.student_id, error = %e, "advice provider failed, using heuristics");
                    local(request)
                }
            },
            AdviceStrategy::Heuristic => local(request),
        };
        debug!(student = %request.student_id, kind = ?suggestion.kind, title = %suggestion.title, "suggestion ready");
        Some(suggestion)
    }

    async fn consult(&self, provider: &dyn AdviceProvider, request: &AnalysisRequest) -> Result<Suggestion, AdviceError> {
        let prompt = build_prompt(request, &self.limits);
        let call = AssertUnwindSafe(provider.complete(SYSTEM_PROMPT, &prompt, self.limits.max_tokens)).catch_unwind();
        let text = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => return Err(AdviceError::Timeout),
            Ok(Err(_)) => return Err(AdviceError::Unusable("provider panicked".to_string())),
            Ok(Ok(result)) => result?,
        };
        normalize_response(&text, request)
    }
}

fn local(request: &AnalysisRequest) -> Suggestion {
    std::panic::catch_unwind(AssertUnwindSafe(|| heuristics::classify(request))).unwrap_or_else(|_| {
        warn!(student = %request.student_id, "heuristic classifier panicked");
        Suggestion::monitoring()
    })
}

/// Last `max` characters of `text`.
fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    let start = text.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &text[start..]
}

/// First `max` characters of `text`.
fn head_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

pub fn build_prompt(request: &AnalysisRequest, limits: &PromptLimits) -> String {
    let mut prompt = String::new();
    if let Some(question) = &request.question {
        prompt.push_str(&format!("Question: {}\n", question.trim()));
    }
    prompt.push_str(&format!(
        "Command: {}\n",
        request.command.as_deref().unwrap_or("unknown command")
    ));
    let errors = head_chars(request.error_output.trim(), limits.error_chars);
    if !errors.is_empty() {
        prompt.push_str(&format!("Error: {errors}\n"));
    }
    let output = tail_chars(request.output.trim(), limits.output_chars);
    if !output.is_empty() {
        prompt.push_str(&format!("Output:\n{output}\n"));
    }
    let skip = request.history.len().saturating_sub(limits.history_entries);
    let recent: Vec<String> = request.history[skip..]
        .iter()
        .map(|h| format!("{} -> {}", h.command, if h.had_error { "ERROR" } else { "OK" }))
        .collect();
    if !recent.is_empty() {
        prompt.push_str(&format!("Recent commands:\n{}\n", recent.join("\n")));
    }
    prompt.push_str("\nBrief fix or next step (under 25 words):");
    prompt
}

/// Turns provider text into a suggestion. The command is the first
/// backtick-quoted snippet, else the first line that proposes something.
pub fn normalize_response(text: &str, request: &AnalysisRequest) -> Result<Suggestion, AdviceError> {
    let message = text.trim();
    if message.is_empty() {
        return Err(AdviceError::Unusable("empty response".to_string()));
    }

    let snippet = message
        .split('`')
        .nth(1)
        .map(str::trim)
        .filter(|s| !s.is_empty() && message.matches('`').count() >= 2);
    let command = snippet.map(str::to_string).or_else(|| {
        message
            .lines()
            .map(str::trim)
            .find(|line| {
                let lower = line.to_lowercase();
                ["try", "next", "consider"].iter().any(|w| lower.contains(w))
            })
            .map(str::to_string)
    });

    let kind = if request.error_output.trim().is_empty() {
        SuggestionKind::General
    } else {
        SuggestionKind::ErrorHelp
    };
    Ok(Suggestion {
        kind,
        title: "Assistant".to_string(),
        message: message.to_string(),
        command,
        rationale: "Based on your recent terminal activity".to_string(),
    })
}
