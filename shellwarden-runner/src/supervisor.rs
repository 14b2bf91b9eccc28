//! Registry of background processes and their buffered output.
//!
//! The supervisor is an owned value shared by cloning; there is no global
//! instance. Each record keeps a bounded line buffer and one read offset per
//! consumer, so several pollers can follow the same process independently.
//! When the buffer overflows, lines are dropped from the front and every
//! offset is shifted left by the same amount.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use shellwarden_config::SupervisorConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExecError, Result};
use crate::process_group::{self, KillSignal};
use crate::types::{ExecutionResult, ProcessStatus};

/// New output for one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollResult {
    pub id: String,
    pub status: ProcessStatus,
    pub lines: Vec<String>,
    /// Consumer offset after this poll.
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMethod {
    /// The process exited within the grace period after cancellation.
    Graceful,
    /// The process group had to be killed.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_ms: Option<u64>,
    pub resources_freed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<TerminationMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl TerminationResult {
    fn rejected(error: &ExecError, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            runtime_ms: None,
            resources_freed: false,
            method: None,
            exit_code,
            suggestion: error.suggestion().map(str::to_string),
        }
    }
}

/// Snapshot of one record for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub runtime_ms: u64,
    pub buffered_lines: usize,
}

struct ProcessRecord {
    id: String,
    pid: Option<u32>,
    command: String,
    status: ProcessStatus,
    buffer: VecDeque<String>,
    offsets: HashMap<String, usize>,
    exit_code: Option<i32>,
    failure: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    eviction: Option<JoinHandle<()>>,
    exited: watch::Sender<bool>,
}

impl ProcessRecord {
    fn summary(&self) -> ProcessSummary {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        ProcessSummary {
            id: self.id.clone(),
            pid: self.pid,
            command: self.command.clone(),
            status: self.status,
            exit_code: self.exit_code,
            failure: self.failure.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            runtime_ms: runtime_ms(self.started_at, end),
            buffered_lines: self.buffer.len(),
        }
    }

    fn push_lines(&mut self, text: &str, max_lines: usize) {
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                self.buffer.push_back(line.to_string());
            }
        }

        let overflow = self.buffer.len().saturating_sub(max_lines);
        if overflow > 0 {
            self.buffer.drain(..overflow);
            for offset in self.offsets.values_mut() {
                *offset = offset.saturating_sub(overflow);
            }
        }
    }
}

struct Registry {
    config: SupervisorConfig,
    records: Mutex<HashMap<String, ProcessRecord>>,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Registry>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("processes", &self.inner.records.lock().len())
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Registry {
                config,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.records.lock().contains_key(id)
    }

    /// Track a freshly spawned process.
    ///
    /// `completion` is driven on its own task; its outcome decides the
    /// terminal status. `cancel` is the token the engine watches for this
    /// process. Must be called from within a tokio runtime.
    pub fn register<F>(
        &self,
        id: String,
        pid: Option<u32>,
        command: String,
        completion: F,
        cancel: CancellationToken,
    ) where
        F: Future<Output = Result<ExecutionResult>> + Send + 'static,
    {
        let (exited, _) = watch::channel(false);
        let record = ProcessRecord {
            id: id.clone(),
            pid,
            command,
            status: ProcessStatus::Running,
            buffer: VecDeque::new(),
            offsets: HashMap::new(),
            exit_code: None,
            failure: None,
            started_at: Utc::now(),
            ended_at: None,
            cancel,
            eviction: None,
            exited,
        };

        if let Some(previous) = self.inner.records.lock().insert(id.clone(), record) {
            warn!(id, previous_pid = ?previous.pid, "replaced background process with duplicate id");
        }
        debug!(id, ?pid, "registered background process");

        let supervisor = self.clone();
        tokio::spawn(async move {
            let outcome = completion.await;
            supervisor.record_completion(&id, outcome);
        });
    }

    /// Append output text to `id`'s buffer. Unknown ids are ignored.
    pub fn append_output(&self, id: &str, text: &str) {
        let max_lines = self.inner.config.max_buffer_lines;
        if let Some(record) = self.inner.records.lock().get_mut(id) {
            record.push_lines(text, max_lines);
        }
    }

    /// Return lines `consumer` has not seen yet and advance its offset.
    ///
    /// With `filter`, only matching lines are returned, but the offset still
    /// moves past everything that was inspected.
    pub fn poll(&self, id: &str, consumer: &str, filter: Option<&str>) -> Result<PollResult> {
        let compiled = filter
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ExecError::InvalidFilterPattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose();

        let mut records = self.inner.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| ExecError::ProcessNotFound { id: id.to_string() })?;
        let regex = compiled?;

        let len = record.buffer.len();
        let offset = record.offsets.entry(consumer.to_string()).or_insert(0);
        let start = (*offset).min(len);
        let lines = record
            .buffer
            .range(start..)
            .filter(|line| regex.as_ref().is_none_or(|regex| regex.is_match(line)))
            .cloned()
            .collect();
        *offset = len;

        Ok(PollResult {
            id: id.to_string(),
            status: record.status,
            lines,
            offset: len,
            exit_code: record.exit_code,
            failure: record.failure.clone(),
        })
    }

    /// Stop a running process. Calling it again reports "already terminated".
    pub async fn terminate(&self, id: &str) -> TerminationResult {
        let (cancel, mut exited, pid, started_at) = {
            let mut records = self.inner.records.lock();
            let Some(record) = records.get_mut(id) else {
                return TerminationResult::rejected(
                    &ExecError::ProcessNotFound { id: id.to_string() },
                    None,
                );
            };
            if record.status.is_terminal() {
                return TerminationResult::rejected(
                    &ExecError::AlreadyTerminal {
                        id: id.to_string(),
                        status: record.status,
                    },
                    record.exit_code,
                );
            }

            record.status = ProcessStatus::Terminated;
            record.ended_at = Some(Utc::now());
            (
                record.cancel.clone(),
                record.exited.subscribe(),
                record.pid,
                record.started_at,
            )
        };

        info!(id, ?pid, "terminating background process");
        cancel.cancel();

        let grace = Duration::from_millis(self.inner.config.termination_grace_ms);
        let exited_in_time = tokio::time::timeout(grace, async {
            exited.wait_for(|exited| *exited).await.map(|_| ())
        })
        .await
        .is_ok();

        let method = if exited_in_time {
            TerminationMethod::Graceful
        } else {
            warn!(id, ?pid, "process ignored termination; killing its process group");
            if let Some(pid) = pid
                && process_group::is_process_tree_alive(pid)
                && let Err(err) = process_group::signal_process_tree(pid, KillSignal::Kill)
            {
                warn!(id, pid, error = %err, "failed to kill process group");
            }
            TerminationMethod::Forced
        };

        let exit_code = {
            let mut records = self.inner.records.lock();
            records.get_mut(id).and_then(|record| {
                self.schedule_eviction(record);
                record.exit_code
            })
        };

        TerminationResult {
            success: true,
            message: format!("Background process `{id}` terminated"),
            runtime_ms: Some(runtime_ms(started_at, Utc::now())),
            resources_freed: true,
            method: Some(method),
            exit_code,
            suggestion: None,
        }
    }

    /// Terminate every running process, e.g. when the host shuts down.
    pub async fn terminate_all(&self) -> Vec<TerminationResult> {
        let running: Vec<String> = self
            .inner
            .records
            .lock()
            .values()
            .filter(|record| record.status == ProcessStatus::Running)
            .map(|record| record.id.clone())
            .collect();

        let tasks: Vec<JoinHandle<TerminationResult>> = running
            .into_iter()
            .map(|id| {
                let supervisor = self.clone();
                tokio::spawn(async move { supervisor.terminate(&id).await })
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "termination task failed"),
            }
        }
        results
    }

    /// All known processes, oldest first.
    pub fn list(&self) -> Vec<ProcessSummary> {
        let mut summaries: Vec<ProcessSummary> = self
            .inner
            .records
            .lock()
            .values()
            .map(ProcessRecord::summary)
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn get(&self, id: &str) -> Option<ProcessSummary> {
        self.inner.records.lock().get(id).map(ProcessRecord::summary)
    }

    fn record_completion(&self, id: &str, outcome: Result<ExecutionResult>) {
        let max_lines = self.inner.config.max_buffer_lines;
        let mut records = self.inner.records.lock();
        let Some(record) = records.get_mut(id) else {
            return;
        };

        record.ended_at = Some(Utc::now());
        let failure = match &outcome {
            Ok(result) => {
                record.exit_code = result.exit_code;
                result.error.clone()
            }
            Err(err) => Some(err.to_string()),
        };

        if record.status == ProcessStatus::Running {
            record.status = match (&outcome, &failure) {
                (_, Some(message)) => {
                    record.push_lines(&format!("[error] {message}"), max_lines);
                    record.failure = Some(message.clone());
                    ProcessStatus::Failed
                }
                (Ok(result), None) if result.aborted => ProcessStatus::Terminated,
                _ => ProcessStatus::Completed,
            };
            self.schedule_eviction(record);
        }

        info!(
            id,
            status = %record.status,
            exit_code = ?record.exit_code,
            "background process exited"
        );
        record.exited.send_replace(true);
    }

    /// Remove the record once the grace period has passed. Replaces any
    /// previously scheduled removal.
    fn schedule_eviction(&self, record: &mut ProcessRecord) {
        if let Some(previous) = record.eviction.take() {
            previous.abort();
        }

        let registry: Weak<Registry> = Arc::downgrade(&self.inner);
        let id = record.id.clone();
        let grace = Duration::from_secs(self.inner.config.eviction_grace_seconds);
        record.eviction = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut records = registry.records.lock();
            if records
                .get(&id)
                .is_some_and(|record| record.status.is_terminal())
            {
                records.remove(&id);
                debug!(id, "evicted background process");
            }
        }));
    }
}

fn runtime_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
