//! Bounded, synchronous-from-the-caller's-view command runs.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::ExecutionCancellation;
use crate::descendants::ScriptScrubber;
use crate::engine::{ExecutionEngine, ExecutionHandle};
use crate::error::{ExecError, Result};
use crate::policy::CommandPolicy;
use crate::types::{CancelReason, ExecutionEvent, ExecutionRequest, ExecutionResult};

/// What a foreground run hands back to the tool layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForegroundOutcome {
    pub result: ExecutionResult,
    /// Structured multi-line report meant for the model.
    pub summary: String,
    /// Text meant for the user.
    pub display: String,
}

#[derive(Debug, Clone)]
pub struct ForegroundRunner {
    engine: ExecutionEngine,
    policy: CommandPolicy,
}

impl ForegroundRunner {
    pub fn new(engine: ExecutionEngine, policy: CommandPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Validate, spawn and wait for `request`.
    ///
    /// `on_update` receives the cumulative display text, throttled to one
    /// call per `exec.update_throttle_ms`; binary detection and the end of the
    /// run are always delivered immediately.
    pub async fn run<F>(
        &self,
        request: &ExecutionRequest,
        caller: CancellationToken,
        mut on_update: F,
    ) -> Result<ForegroundOutcome>
    where
        F: FnMut(&str),
    {
        self.validate(request)?;
        let command = request.command.trim();

        if caller.is_cancelled() {
            info!(command, "caller cancelled before the command started");
            let result = ExecutionResult {
                aborted: true,
                cancel_reason: Some(CancelReason::Caller),
                ..ExecutionResult::default()
            };
            let display = "Command was cancelled before it could start.".to_string();
            return Ok(ForegroundOutcome {
                summary: format!("{display}\n{}", self.summarize(request, &result)),
                result,
                display,
            });
        }

        let config = self.engine.config();
        let timeout = request.effective_timeout(config);
        let throttle = Duration::from_millis(config.update_throttle_ms);

        let mut cancellation = ExecutionCancellation::new(caller, timeout);
        let ExecutionHandle {
            pid,
            mut events,
            completion,
            scrubber,
        } = self
            .engine
            .execute(command, &request.cwd, request.options(), cancellation.token());
        debug!(?pid, command, timeout_ms = timeout.as_millis() as u64, "foreground command started");

        let mut live = LiveDisplay::new(scrubber);
        let mut last_update = Instant::now();
        while let Some(event) = events.recv().await {
            let flush_now = live.apply(event);
            if flush_now || last_update.elapsed() >= throttle {
                on_update(&live.text());
                last_update = Instant::now();
            }
        }

        let mut result = completion.wait().await?;
        cancellation.disarm();
        if result.aborted {
            result.cancel_reason = cancellation.reason();
        }

        let display = self.display_text(request, &result);
        on_update(&display);

        let summary = match narrative(request, &result, timeout) {
            Some(narrative) => format!("{narrative}\n{}", self.summarize(request, &result)),
            None => self.summarize(request, &result),
        };
        debug!(
            ?pid,
            exit_code = ?result.exit_code,
            aborted = result.aborted,
            reason = ?result.cancel_reason,
            "foreground command finished"
        );

        Ok(ForegroundOutcome {
            result,
            summary,
            display,
        })
    }

    fn validate(&self, request: &ExecutionRequest) -> Result<()> {
        if request.command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        if CommandPolicy::extract_root_commands(&request.command).is_empty() {
            return Err(ExecError::NoIdentifiableRoot);
        }
        request.validate(self.engine.config())?;
        self.policy.check(&request.command)
    }

    fn display_text(&self, request: &ExecutionRequest, result: &ExecutionResult) -> String {
        let body = if result.output.trim().is_empty() {
            result
                .error
                .clone()
                .unwrap_or_else(|| "(no output)".to_string())
        } else {
            result.output.clone()
        };
        match narrative(request, result, request.effective_timeout(self.engine.config())) {
            Some(narrative) => format!("{narrative}\n{body}"),
            None => body,
        }
    }

    fn summarize(&self, request: &ExecutionRequest, result: &ExecutionResult) -> String {
        let or_none = |value: Option<String>| value.unwrap_or_else(|| "(none)".to_string());
        let output = if result.output.trim().is_empty() {
            "(empty)".to_string()
        } else {
            result.output.trim_end().to_string()
        };
        let background = if !result.descendant_pids_available {
            "(unavailable)".to_string()
        } else if result.descendant_pids.is_empty() {
            "(none)".to_string()
        } else {
            result
                .descendant_pids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut summary = String::new();
        let _ = writeln!(summary, "Command: {}", request.command.trim());
        let _ = writeln!(summary, "Directory: {}", request.cwd.display());
        let _ = writeln!(summary, "Output: {output}");
        let _ = writeln!(summary, "Error: {}", or_none(result.error.clone()));
        let _ = writeln!(
            summary,
            "Exit Code: {}",
            or_none(result.exit_code.map(|code| code.to_string()))
        );
        let _ = writeln!(
            summary,
            "Signal: {}",
            or_none(result.signal.map(|signal| signal.to_string()))
        );
        let _ = writeln!(summary, "Background PIDs: {background}");
        let _ = write!(
            summary,
            "Process Group PGID: {}",
            or_none(result.pid.map(|pid| pid.to_string()))
        );
        summary
    }
}

fn narrative(
    request: &ExecutionRequest,
    result: &ExecutionResult,
    timeout: Duration,
) -> Option<String> {
    if !result.aborted {
        return None;
    }
    let text = match result.cancel_reason {
        Some(CancelReason::Timeout) => format!(
            "Command timed out after {}ms and was terminated. Output before the timeout is shown below.",
            request.timeout_ms.unwrap_or(timeout.as_millis() as u64)
        ),
        Some(CancelReason::Caller) | None => {
            "Command was cancelled by the user before it could complete. Output before cancellation is shown below."
                .to_string()
        }
    };
    Some(text)
}

/// Cumulative user-facing text while a command runs.
#[derive(Debug, Default)]
struct LiveDisplay {
    text: String,
    binary: bool,
    scrubber: ScriptScrubber,
}

impl LiveDisplay {
    fn new(scrubber: ScriptScrubber) -> Self {
        Self {
            scrubber,
            ..Self::default()
        }
    }

    /// Fold `event` in. Returns true when the change must be shown immediately.
    fn apply(&mut self, event: ExecutionEvent) -> bool {
        match event {
            ExecutionEvent::Data { chunk } => {
                if !self.binary {
                    self.text.push_str(&chunk);
                }
                false
            }
            ExecutionEvent::BinaryDetected => {
                self.binary = true;
                self.text = "[Binary output detected. Halting stream...]".to_string();
                true
            }
            ExecutionEvent::BinaryProgress { bytes_received } => {
                self.binary = true;
                self.text = format!(
                    "[Receiving binary output... {} received]",
                    format_bytes(bytes_received)
                );
                false
            }
        }
    }

    /// Scrubbed as a whole so wrapper text split across chunks is still caught.
    fn text(&self) -> Cow<'_, str> {
        self.scrubber.scrub(&self.text)
    }
}

fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let value = bytes as f64;
    if value < KIB {
        format!("{bytes} B")
    } else if value < KIB * KIB {
        format!("{:.1} KB", value / KIB)
    } else {
        format!("{:.1} MB", value / (KIB * KIB))
    }
}
