//! Provisioning script format and result records.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::variables::{extract_variable_names, substitute, Variables};

/// What to do with the rest of the script when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFail {
    /// Stop and report the script as failed.
    #[default]
    Abort,
    /// Stop and report what ran so far as a success.
    Skip,
    /// Carry on with the next step.
    Continue,
}

impl fmt::Display for OnFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Abort => "abort",
            Self::Skip => "skip",
            Self::Continue => "continue",
        };
        f.write_str(s)
    }
}

/// One send / expect / capture exchange. Unset fields fall back to the
/// script defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionStep {
    /// Command template, e.g. `"SET SN {serial_number}"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send: Option<String>,

    /// Regex to wait for. Named groups become captures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,

    /// Alternative patterns, first match wins. Takes precedence over `expect`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_any: Option<Vec<String>>,

    /// Noise filters for this step, replacing the script-wide list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_patterns: Option<Vec<String>>,

    /// Prompt prefix stripped from received lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip_prompt: Option<String>,

    /// Accepted for file compatibility. Lines always accumulate until the
    /// pattern matches or the step times out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiline: Option<bool>,

    /// Seconds to wait for the expect pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Seconds to wait before sending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_before: Option<f64>,

    /// Seconds to wait after a successful attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_after: Option<f64>,

    /// Number of attempts; 1 means no retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Seconds between attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<OnFail>,

    /// Seconds to wait after the step before the next one starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_delay: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProvisionStep {
    /// A step that only sends.
    pub fn send(command: impl Into<String>) -> Self {
        Self {
            send: Some(command.into()),
            ..Self::default()
        }
    }

    /// A step that sends and waits for `pattern`.
    pub fn exchange(command: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            send: Some(command.into()),
            expect: Some(pattern.into()),
            ..Self::default()
        }
    }

    /// Label used in logs and errors.
    pub fn label(&self, index: usize) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Step {}", index + 1))
    }

    /// Whether the step waits for a reply.
    pub fn has_expect(&self) -> bool {
        self.expect.as_deref().is_some_and(|p| !p.is_empty())
            || self.expect_any.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// Ordered steps plus script-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionScript {
    pub name: String,
    pub steps: Vec<ProvisionStep>,
    pub default_timeout: f64,
    pub default_retries: u32,
    pub default_retry_delay: f64,
    pub default_on_fail: OnFail,
    pub default_post_delay: f64,
    pub global_ignore_patterns: Option<Vec<String>>,
    pub global_strip_prompt: Option<String>,
}

impl Default for ProvisionScript {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            steps: Vec::new(),
            default_timeout: 5.0,
            default_retries: 1,
            default_retry_delay: 0.5,
            default_on_fail: OnFail::Abort,
            default_post_delay: 0.0,
            global_ignore_patterns: None,
            global_strip_prompt: None,
        }
    }
}

/// A problem found by [`ProvisionScript::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptIssue {
    /// A regex that will never compile. Fatal for the step it belongs to.
    InvalidPattern {
        step: Option<usize>,
        pattern: String,
        reason: String,
    },
    /// A template name not provided up front. May still be captured at run
    /// time by an earlier step.
    UnknownVariable { step: usize, name: String },
    /// A step with nothing to send and nothing to wait for.
    EmptyStep { step: usize },
}

impl fmt::Display for ScriptIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPattern {
                step: Some(step),
                pattern,
                reason,
            } => write!(f, "step {}: invalid pattern {pattern:?}: {reason}", step + 1),
            Self::InvalidPattern {
                step: None,
                pattern,
                reason,
            } => write!(f, "global ignore pattern {pattern:?} is invalid: {reason}"),
            Self::UnknownVariable { step, name } => {
                write!(f, "step {}: variable {{{name}}} is not known up front", step + 1)
            }
            Self::EmptyStep { step } => write!(f, "step {} neither sends nor expects", step + 1),
        }
    }
}

impl ScriptIssue {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidPattern { .. })
    }
}

impl ProvisionScript {
    /// Parse a script from its JSON form (the panel file's
    /// `provision.script` object).
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Render the script as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Step `index` with every default filled in.
    pub fn resolve(&self, index: usize) -> Option<ResolvedStep> {
        let step = self.steps.get(index)?;
        let secs = |v: Option<f64>, default: f64| {
            Duration::from_secs_f64(v.unwrap_or(default).max(0.0))
        };

        Some(ResolvedStep {
            index,
            label: step.label(index),
            send: step.send.clone().filter(|s| !s.is_empty()),
            expect: step.expect.clone().filter(|s| !s.is_empty()),
            expect_any: step.expect_any.clone().filter(|p| !p.is_empty()),
            ignore_patterns: step
                .ignore_patterns
                .clone()
                .or_else(|| self.global_ignore_patterns.clone())
                .unwrap_or_default(),
            strip_prompt: step
                .strip_prompt
                .clone()
                .or_else(|| self.global_strip_prompt.clone()),
            timeout: secs(step.timeout, self.default_timeout),
            delay_before: secs(step.delay_before, 0.0),
            delay_after: secs(step.delay_after, 0.0),
            attempts: step.retries.unwrap_or(self.default_retries).max(1),
            retry_delay: secs(step.retry_delay, self.default_retry_delay),
            on_fail: step.on_fail.unwrap_or(self.default_on_fail),
            post_delay: secs(step.post_delay, self.default_post_delay),
        })
    }

    /// Check every pattern compiles and every template variable is either in
    /// `available` or captured by an earlier step.
    pub fn validate(&self, available: &Variables) -> Vec<ScriptIssue> {
        let mut issues = Vec::new();

        for pattern in self.global_ignore_patterns.iter().flatten() {
            if let Err(e) = Regex::new(pattern) {
                issues.push(ScriptIssue::InvalidPattern {
                    step: None,
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let mut known: Vec<String> = available.keys().cloned().collect();
        for (i, step) in self.steps.iter().enumerate() {
            if step.send.is_none() && !step.has_expect() {
                issues.push(ScriptIssue::EmptyStep { step: i });
            }

            if let Some(template) = &step.send {
                for name in extract_variable_names(template) {
                    if !known.contains(&name) {
                        issues.push(ScriptIssue::UnknownVariable { step: i, name });
                    }
                }
            }

            let patterns = step
                .expect
                .iter()
                .chain(step.expect_any.iter().flatten())
                .chain(step.ignore_patterns.iter().flatten());
            for pattern in patterns {
                // Placeholders are substituted before compiling; numeric
                // names are regex repetition counts.
                let placeholders: Variables = extract_variable_names(pattern)
                    .into_iter()
                    .filter(|n| !n.chars().all(|c| c.is_ascii_digit()))
                    .map(|n| (n, "x".to_string()))
                    .collect();
                let (candidate, _) = substitute(pattern, &placeholders);
                match Regex::new(&candidate) {
                    Ok(re) => known.extend(re.capture_names().flatten().map(str::to_string)),
                    Err(e) => issues.push(ScriptIssue::InvalidPattern {
                        step: Some(i),
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
        }

        issues
    }
}

/// A step with script defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    pub index: usize,
    pub label: String,
    pub send: Option<String>,
    pub expect: Option<String>,
    pub expect_any: Option<Vec<String>>,
    pub ignore_patterns: Vec<String>,
    pub strip_prompt: Option<String>,
    pub timeout: Duration,
    pub delay_before: Duration,
    pub delay_after: Duration,
    /// Total attempts, at least one.
    pub attempts: u32,
    pub retry_delay: Duration,
    pub on_fail: OnFail,
    pub post_delay: Duration,
}

impl ResolvedStep {
    pub fn has_expect(&self) -> bool {
        self.expect.is_some() || self.expect_any.is_some()
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub step_index: usize,
    /// Raw text received during the last attempt.
    pub response: Option<String>,
    pub matched_text: Option<String>,
    pub captures: BTreeMap<String, String>,
    pub error: Option<String>,
    /// Seconds spent on the step, all attempts included.
    pub elapsed: f64,
    pub lines_received: usize,
    /// Attempts beyond the first.
    pub retries_used: u32,
}

/// Outcome of a whole script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionResult {
    pub success: bool,
    pub steps_completed: usize,
    pub total_steps: usize,
    /// Every capture made during the run, merged.
    pub captures: BTreeMap<String, String>,
    pub step_results: Vec<StepResult>,
    pub error: Option<String>,
    pub elapsed: f64,
}

impl ProvisionResult {
    /// First step that did not succeed.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.step_results.iter().find(|r| !r.success)
    }
}
