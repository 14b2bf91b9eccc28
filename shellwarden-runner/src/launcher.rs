//! Starts commands that outlive the request that launched them.

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::descendants::ScriptScrubber;
use crate::engine::{ExecutionCompletion, ExecutionEngine, ExecutionHandle};
use crate::error::{ExecError, Result};
use crate::policy::CommandPolicy;
use crate::stream::LineAssembler;
use crate::supervisor::ProcessSupervisor;
use crate::types::{ExecOptions, ExecutionEvent, ExecutionRequest, ExecutionResult};

const ID_SUFFIX_LEN: usize = 6;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const BINARY_NOTICE: &str = "[Binary output detected; further output is not buffered]";

/// Identifies a launched background process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundHandle {
    pub id: String,
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct BackgroundLauncher {
    engine: ExecutionEngine,
    policy: CommandPolicy,
    supervisor: ProcessSupervisor,
}

impl BackgroundLauncher {
    pub fn new(
        engine: ExecutionEngine,
        policy: CommandPolicy,
        supervisor: ProcessSupervisor,
    ) -> Self {
        Self {
            engine,
            policy,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Validate and spawn `request`, then hand it to the supervisor.
    ///
    /// The request timeout is ignored: a background process runs until it
    /// exits or is terminated through the supervisor.
    pub async fn launch(&self, request: &ExecutionRequest) -> Result<BackgroundHandle> {
        let command = request.command.trim();
        if command.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        if CommandPolicy::extract_root_commands(command).is_empty() {
            return Err(ExecError::NoIdentifiableRoot);
        }
        self.policy.check(command)?;

        let cancel = CancellationToken::new();
        let options = ExecOptions {
            background: true,
            ..request.options()
        };
        let ExecutionHandle {
            pid,
            events,
            completion,
            scrubber,
        } = self
            .engine
            .execute(command, &request.cwd, options, cancel.clone());

        let Some(pid) = pid else {
            let result = completion.wait().await?;
            return Err(ExecError::SpawnFailure(
                result
                    .error
                    .unwrap_or_else(|| "process exited before reporting a pid".to_string()),
            ));
        };

        let id = self.next_id();
        self.supervisor.register(
            id.clone(),
            Some(pid),
            command.to_string(),
            forward_output(
                self.supervisor.clone(),
                id.clone(),
                events,
                completion,
                scrubber,
            ),
            cancel,
        );
        info!(id, pid, command, "background command started");

        Ok(BackgroundHandle { id, pid })
    }

    fn next_id(&self) -> String {
        loop {
            let id = generate_id();
            if !self.supervisor.contains(&id) {
                return id;
            }
        }
    }
}

/// Feed complete lines into the supervisor, then resolve with the result.
///
/// The result is only reported after the event stream closed, so a poller
/// that sees a terminal status has already been offered every line.
async fn forward_output(
    supervisor: ProcessSupervisor,
    id: String,
    mut events: mpsc::Receiver<ExecutionEvent>,
    completion: ExecutionCompletion,
    scrubber: ScriptScrubber,
) -> Result<ExecutionResult> {
    let mut lines = LineAssembler::default();
    while let Some(event) = events.recv().await {
        match event {
            ExecutionEvent::Data { chunk } => {
                let complete = lines.push(&chunk);
                if !complete.is_empty() {
                    let text = complete.join("\n");
                    supervisor.append_output(&id, &scrubber.scrub(&text));
                }
            }
            ExecutionEvent::BinaryDetected => supervisor.append_output(&id, BINARY_NOTICE),
            ExecutionEvent::BinaryProgress { .. } => {}
        }
    }
    if let Some(rest) = lines.finish() {
        supervisor.append_output(&id, &scrubber.scrub(&rest));
    }
    completion.wait().await
}

fn generate_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| char::from(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())]))
        .collect();
    format!("bg_{millis}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_the_documented_shape() {
        let id = generate_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "bg");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), ID_SUFFIX_LEN);
        assert!(
            parts[2]
                .bytes()
                .all(|byte| byte.is_ascii_digit() || byte.is_ascii_lowercase())
        );
    }

    #[test]
    fn ids_are_distinct() {
        assert_ne!(generate_id(), generate_id());
    }
}
