//! Script execution over a [`LineDevice`].
//!
//! Each step resolves its settings against the script defaults, then makes up
//! to `attempts` tries. A try optionally sends the substituted command and,
//! when the step expects a reply, feeds received lines into a fresh
//! [`ResponseAccumulator`] until a pattern matches or the step times out.
//! Captures from a successful step are merged into the [`VariableContext`]
//! before the next step starts.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::accumulator::{ResponseAccumulator, SearchMatch};
use super::models::{OnFail, ProvisionResult, ProvisionScript, ResolvedStep, StepResult};
use super::variables::VariableContext;
use crate::device::LineDevice;
use crate::obs;

/// Upper bound on a single read while waiting for a pattern.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const RETRIES_EXHAUSTED: &str = "Pattern not matched after all retries";

/// How one try of a step ended.
enum Attempt {
    /// Pattern matched, or the step had nothing to wait for.
    Matched(Option<SearchMatch>),
    /// Deadline passed without a match.
    TimedOut,
    /// Device error; worth another try.
    Failed(String),
    /// Retrying cannot help.
    Fatal(String),
}

/// Runs [`ProvisionScript`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisioningEngine;

impl ProvisioningEngine {
    pub fn new() -> Self {
        Self
    }

    /// Execute `script` against `device`.
    ///
    /// Never returns an error: step failures are applied through each
    /// step's `on_fail` policy and reported in the [`ProvisionResult`].
    pub async fn execute(
        &self,
        script: &ProvisionScript,
        device: &mut dyn LineDevice,
        context: &mut VariableContext,
    ) -> ProvisionResult {
        let started = Instant::now();
        let total_steps = script.steps.len();
        let mut step_results = Vec::with_capacity(total_steps);

        info!(script = %script.name, steps = total_steps, port = %device.port(), "starting provisioning script");

        for index in 0..total_steps {
            let Some(step) = script.resolve(index) else {
                break;
            };
            info!(step = index + 1, label = %step.label, "executing step");

            let result = self.execute_step(&step, device, context).await;
            let success = result.success;
            let error = result.error.clone().unwrap_or_default();

            if success && !result.captures.is_empty() {
                info!(step = index + 1, captures = ?result.captures, "captured");
                context.add_captures(&result.captures);
            }
            step_results.push(result);

            if !success {
                warn!(step = index + 1, on_fail = %step.on_fail, error = %error, "step failed");
                match step.on_fail {
                    OnFail::Abort => {
                        let result = ProvisionResult {
                            success: false,
                            steps_completed: index,
                            total_steps,
                            captures: context.all_captures().clone(),
                            step_results,
                            error: Some(format!("Step {} failed: {}", index + 1, error)),
                            elapsed: started.elapsed().as_secs_f64(),
                        };
                        finished(&script.name, &result);
                        return result;
                    }
                    OnFail::Skip => {
                        info!("skipping remaining steps");
                        break;
                    }
                    OnFail::Continue => {}
                }
            }

            if !step.post_delay.is_zero() {
                tokio::time::sleep(step.post_delay).await;
            }
        }

        let result = ProvisionResult {
            success: true,
            steps_completed: step_results.len(),
            total_steps,
            captures: context.all_captures().clone(),
            step_results,
            error: None,
            elapsed: started.elapsed().as_secs_f64(),
        };
        finished(&script.name, &result);
        result
    }

    async fn execute_step(
        &self,
        step: &ResolvedStep,
        device: &mut dyn LineDevice,
        context: &VariableContext,
    ) -> StepResult {
        let started = Instant::now();
        let mut last_failure = StepResult {
            step_index: step.index,
            ..StepResult::default()
        };

        for attempt in 0..step.attempts {
            let mut acc =
                ResponseAccumulator::new(&step.ignore_patterns, step.strip_prompt.as_deref());
            let outcome = self.attempt(step, device, context, &mut acc).await;

            let response = step.has_expect().then(|| acc.raw_text());
            match outcome {
                Attempt::Matched(found) => {
                    let found = found.unwrap_or_default();
                    return StepResult {
                        success: true,
                        step_index: step.index,
                        response,
                        matched_text: step.has_expect().then_some(found.matched_text),
                        captures: found.captures,
                        error: None,
                        elapsed: started.elapsed().as_secs_f64(),
                        lines_received: acc.line_count(),
                        retries_used: attempt,
                    };
                }
                Attempt::Fatal(error) => {
                    return StepResult {
                        success: false,
                        step_index: step.index,
                        error: Some(error),
                        elapsed: started.elapsed().as_secs_f64(),
                        retries_used: attempt,
                        ..StepResult::default()
                    };
                }
                Attempt::TimedOut => {
                    debug!(
                        step = step.index + 1,
                        lines = acc.line_count(),
                        "timeout waiting for pattern"
                    );
                    last_failure.error = Some(RETRIES_EXHAUSTED.to_string());
                }
                Attempt::Failed(error) => {
                    warn!(step = step.index + 1, error = %error, "step attempt failed");
                    last_failure.error = Some(error);
                }
            }

            last_failure.response = response;
            last_failure.lines_received = acc.line_count();
            last_failure.retries_used = attempt;

            if attempt + 1 < step.attempts {
                debug!(
                    step = step.index + 1,
                    attempt = attempt + 1,
                    attempts = step.attempts,
                    delay_ms = step.retry_delay.as_millis() as u64,
                    "retrying step"
                );
                tokio::time::sleep(step.retry_delay).await;
            }
        }

        last_failure.elapsed = started.elapsed().as_secs_f64();
        last_failure
    }

    async fn attempt(
        &self,
        step: &ResolvedStep,
        device: &mut dyn LineDevice,
        context: &VariableContext,
        acc: &mut ResponseAccumulator,
    ) -> Attempt {
        if !step.delay_before.is_zero() {
            tokio::time::sleep(step.delay_before).await;
        }

        if let Some(template) = &step.send {
            let (command, missing) = context.substitute(template);
            if !missing.is_empty() {
                return Attempt::Fatal(format!("Missing variables: {}", missing.join(", ")));
            }

            let drained = device.drain();
            if drained > 0 {
                debug!(drained, "drained pending lines");
            }
            debug!(step = step.index + 1, command = %command, "tx");
            if let Err(e) = device.write_line(&command).await {
                return Attempt::Failed(e.to_string());
            }
        }

        if !step.has_expect() {
            if !step.delay_after.is_zero() {
                tokio::time::sleep(step.delay_after).await;
            }
            return Attempt::Matched(None);
        }

        let expect = step.expect.as_deref().map(|p| substitute_pattern(context, p));
        let expect_any = step
            .expect_any
            .as_ref()
            .map(|patterns| patterns.iter().map(|p| substitute_pattern(context, p)).collect::<Vec<_>>());

        let deadline = Instant::now() + step.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match device.read_line(remaining.min(POLL_INTERVAL)).await {
                Ok(Some(line)) => {
                    debug!(step = step.index + 1, line = %line, "rx");
                    acc.add_line(&line);

                    let found = match (&expect_any, &expect) {
                        (Some(patterns), _) => acc.search_any(patterns).map(|(_, m)| m),
                        (None, Some(pattern)) => acc.search(pattern),
                        (None, None) => None,
                    };
                    if let Some(found) = found {
                        if !step.delay_after.is_zero() {
                            tokio::time::sleep(step.delay_after).await;
                        }
                        return Attempt::Matched(Some(found));
                    }
                }
                Ok(None) => {}
                Err(e) => return Attempt::Failed(e.to_string()),
            }
        }

        Attempt::TimedOut
    }
}

fn substitute_pattern(context: &VariableContext, pattern: &str) -> String {
    let (pattern, missing) = context.substitute(pattern);
    if !missing.is_empty() {
        warn!(missing = ?missing, "missing variables in expect pattern");
    }
    pattern
}

fn finished(script: &str, result: &ProvisionResult) {
    obs::emit_provision_finished(
        script,
        result.success,
        result.steps_completed,
        (result.elapsed * 1000.0) as u64,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fakes::FakeLineDevice;
    use crate::provisioning::models::ProvisionStep;
    use crate::provisioning::variables::Variables;

    fn context() -> VariableContext {
        VariableContext::from_parts(Variables::new(), Variables::new(), Variables::new())
    }

    fn echo_device() -> FakeLineDevice {
        FakeLineDevice::with_responder("target", |cmd| match cmd {
            "version" => vec!["[DBG] tick".into(), "> fw v2.4".into()],
            "id" => vec!["ID=ABC123".into()],
            _ => vec!["OK".into()],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_apply_before_matching() {
        let script = ProvisionScript {
            global_ignore_patterns: Some(vec!["^\\[DBG\\]".into()]),
            global_strip_prompt: Some("> ".into()),
            steps: vec![ProvisionStep::exchange("version", "^fw v(?P<fw>\\S+)$")],
            ..ProvisionScript::default()
        };
        let mut dev = echo_device();
        let mut ctx = context();

        let result = ProvisioningEngine::new()
            .execute(&script, &mut dev, &mut ctx)
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.captures["fw"], "2.4");
        assert_eq!(result.step_results[0].lines_received, 2);
        assert_eq!(result.step_results[0].matched_text.as_deref(), Some("fw v2.4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_any_first_pattern_wins() {
        let script = ProvisionScript {
            steps: vec![ProvisionStep {
                expect_any: Some(vec!["^FAIL".into(), "^OK$".into()]),
                ..ProvisionStep::send("commit")
            }],
            ..ProvisionScript::default()
        };
        let mut dev = echo_device();
        let mut ctx = context();

        let result = ProvisioningEngine::new()
            .execute(&script, &mut dev, &mut ctx)
            .await;
        assert!(result.success);
        assert_eq!(result.step_results[0].matched_text.as_deref(), Some("OK"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_send_variable_fails_without_sending() {
        let script = ProvisionScript {
            steps: vec![ProvisionStep {
                retries: Some(3),
                ..ProvisionStep::exchange("SET {serial_number}", "OK")
            }],
            ..ProvisionScript::default()
        };
        let mut dev = echo_device();
        let mut ctx = context();

        let result = ProvisioningEngine::new()
            .execute(&script, &mut dev, &mut ctx)
            .await;

        assert!(!result.success);
        assert!(dev.sent().is_empty());
        assert_eq!(result.step_results[0].retries_used, 0);
        assert_eq!(
            result.error.as_deref(),
            Some("Step 1 failed: Missing variables: serial_number")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_fresh_accumulator() {
        let mut calls = 0;
        let mut dev = FakeLineDevice::with_responder("target", move |_| {
            calls += 1;
            if calls == 1 {
                vec!["BUSY".into()]
            } else {
                vec!["READY".into()]
            }
        });
        let script = ProvisionScript {
            steps: vec![ProvisionStep {
                retries: Some(2),
                timeout: Some(1.0),
                ..ProvisionStep::exchange("status", "READY")
            }],
            ..ProvisionScript::default()
        };
        let mut ctx = context();

        let result = ProvisioningEngine::new()
            .execute(&script, &mut dev, &mut ctx)
            .await;

        assert!(result.success);
        let step = &result.step_results[0];
        assert_eq!(step.retries_used, 1);
        assert_eq!(step.lines_received, 1);
        assert_eq!(step.response.as_deref(), Some("READY"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_raw_text() {
        let mut dev = FakeLineDevice::always("target", "NOPE");
        let script = ProvisionScript {
            steps: vec![ProvisionStep {
                retries: Some(2),
                timeout: Some(1.0),
                ..ProvisionStep::exchange("status", "READY")
            }],
            ..ProvisionScript::default()
        };
        let mut ctx = context();

        let result = ProvisioningEngine::new()
            .execute(&script, &mut dev, &mut ctx)
            .await;

        assert!(!result.success);
        let step = &result.step_results[0];
        assert_eq!(step.error.as_deref(), Some(RETRIES_EXHAUSTED));
        assert_eq!(step.response.as_deref(), Some("NOPE"));
        assert_eq!(step.retries_used, 1);
        assert_eq!(dev.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_step_passes_through() {
        let script = ProvisionScript {
            steps: vec![ProvisionStep {
                description: Some("-- calibration --".into()),
                ..ProvisionStep::default()
            }],
            ..ProvisionScript::default()
        };
        let mut dev = echo_device();
        let mut ctx = context();

        let result = ProvisioningEngine::new()
            .execute(&script, &mut dev, &mut ctx)
            .await;

        assert!(result.success);
        assert_eq!(result.steps_completed, 1);
        assert!(dev.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_delay_applies_between_steps() {
        let script = ProvisionScript {
            default_post_delay: 2.0,
            steps: vec![ProvisionStep::send("a"), ProvisionStep::send("b")],
            ..ProvisionScript::default()
        };
        let mut dev = echo_device();
        let mut ctx = context();

        let started = Instant::now();
        let result = ProvisioningEngine::new()
            .execute(&script, &mut dev, &mut ctx)
            .await;

        assert!(result.success);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }
}
