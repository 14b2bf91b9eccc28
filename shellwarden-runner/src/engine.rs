//! Spawns one shell process per command and streams its merged output.
//!
//! stdout and stderr are read by two reader tasks into a single internal
//! channel, so chunks are observed in arrival order. The driver task decodes
//! them, forwards [`ExecutionEvent`]s on a bounded channel, watches the
//! cancellation token and finally produces exactly one [`ExecutionResult`].
//!
//! Consumers must either drain `events` or drop the receiver; the driver
//! applies backpressure through the bounded channel. `Data` chunks are raw:
//! run complete lines or the cumulative text through the handle's
//! [`ScriptScrubber`] before showing them to anyone.

use std::future::pending;
use std::io::ErrorKind;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use shellwarden_config::ExecConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descendants::{DescendantProbe, ScriptScrubber};
use crate::error::{ExecError, Result};
#[cfg(unix)]
use crate::process_group;
use crate::process_group::KillSignal;
use crate::shell::{ShellInvocation, resolve_shell};
use crate::stream::{BinarySniffer, Utf8StreamDecoder};
use crate::types::{ExecOptions, ExecutionEvent, ExecutionResult};

const READ_BUFFER_BYTES: usize = 8_192;
const CHUNK_CHANNEL_CAPACITY: usize = 128;
const RESTRICTED_ENV_KEEP: &[&str] = &["PATH", "HOME", "LANG", "TERM"];
/// Aggregated output kept for background runs; their lines live in the supervisor.
const BACKGROUND_OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Live view of one spawned execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    /// OS pid of the shell; also the process-group id on Unix.
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ExecutionEvent>,
    pub completion: ExecutionCompletion,
    /// Strips wrapper text from live output. The result is already scrubbed.
    pub scrubber: ScriptScrubber,
}

/// Resolves to the terminal [`ExecutionResult`].
#[derive(Debug)]
pub struct ExecutionCompletion {
    rx: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionCompletion {
    fn ready(result: ExecutionResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait for the result. Fails only if the driver task vanished.
    pub async fn wait(self) -> Result<ExecutionResult> {
        self.rx.await.map_err(|_| {
            ExecError::UnexpectedEngineFailure(
                "execution task ended without producing a result".to_string(),
            )
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    config: ExecConfig,
    shell: String,
}

impl ExecutionEngine {
    pub fn new(config: ExecConfig) -> Self {
        let shell = resolve_shell(config.preferred_shell.as_deref());
        Self { config, shell }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Spawn `command` in `cwd`.
    ///
    /// Never fails: a spawn error yields `pid = None` and a completion that
    /// is already resolved with the error recorded in-band. Must be called
    /// from within a tokio runtime.
    pub fn execute(
        &self,
        command: &str,
        cwd: &Path,
        options: ExecOptions,
        cancel: CancellationToken,
    ) -> ExecutionHandle {
        let probe = if cfg!(unix) && self.config.discover_descendants {
            DescendantProbe::create()
        } else {
            None
        };
        let (script, scrubber) = probe.as_ref().map_or_else(
            || (command.to_string(), ScriptScrubber::default()),
            |probe| probe.wrap(command),
        );

        let mut cmd = self.build_command(script, cwd, options);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(command, cwd = %cwd.display(), error = %err, "failed to spawn command");
                let (_, events) = mpsc::channel(1);
                return ExecutionHandle {
                    pid: None,
                    events,
                    completion: ExecutionCompletion::ready(ExecutionResult::spawn_failure(
                        format!("failed to spawn `{}`: {err}", self.shell),
                    )),
                    scrubber: ScriptScrubber::default(),
                };
            }
        };

        let pid = child.id();
        debug!(?pid, command, cwd = %cwd.display(), "spawned command");

        let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>(CHUNK_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_output_stream(
                stdout,
                StreamKind::Stdout,
                chunk_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_output_stream(
                stderr,
                StreamKind::Stderr,
                chunk_tx,
            )));
        }

        let (events_tx, events) = mpsc::channel(self.config.event_channel_capacity);
        let (result_tx, result_rx) = oneshot::channel();
        let driver = Driver::new(&self.config, options, events_tx, scrubber.clone());

        tokio::spawn(async move {
            let (result, events_tx) = driver
                .run(child, chunk_rx, readers, cancel, pid, probe)
                .await;
            let _ = result_tx.send(result);
            // The event stream closes only after the result is out.
            drop(events_tx);
        });

        ExecutionHandle {
            pid,
            events,
            completion: ExecutionCompletion { rx: result_rx },
            scrubber,
        }
    }

    fn build_command(&self, script: String, cwd: &Path, options: ExecOptions) -> Command {
        let invocation = ShellInvocation::for_script(self.shell.clone(), script);
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        command.current_dir(cwd);

        if options.restricted {
            let kept: Vec<(String, String)> = RESTRICTED_ENV_KEEP
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|value| ((*key).to_string(), value)))
                .collect();
            command.env_clear();
            command.envs(kept);
        }
        command.env("PAGER", "cat");
        command.env("GIT_PAGER", "cat");
        command.env("SHELLWARDEN", "1");

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(target_os = "linux")]
        let parent_pid = unsafe { libc::getpid() };

        #[cfg(unix)]
        unsafe {
            command.pre_exec(move || {
                process_group::detach_from_tty()?;
                #[cfg(target_os = "linux")]
                process_group::set_parent_death_signal(parent_pid)?;
                Ok(())
            });
        }

        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

type Chunk = (StreamKind, Vec<u8>);

async fn read_output_stream<R>(mut reader: R, kind: StreamKind, tx: mpsc::Sender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((kind, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

struct Driver {
    events_tx: mpsc::Sender<ExecutionEvent>,
    stdout: Utf8StreamDecoder,
    stderr: Utf8StreamDecoder,
    sniffer: BinarySniffer,
    output: String,
    /// Keep only this many trailing bytes of `output`; `None` keeps everything.
    output_limit: Option<usize>,
    total_bytes: u64,
    binary_announced: bool,
    kill_escalation: Duration,
    drain_timeout: Duration,
    scrubber: ScriptScrubber,
}

impl Driver {
    fn new(
        config: &ExecConfig,
        options: ExecOptions,
        events_tx: mpsc::Sender<ExecutionEvent>,
        scrubber: ScriptScrubber,
    ) -> Self {
        Self {
            events_tx,
            stdout: Utf8StreamDecoder::default(),
            stderr: Utf8StreamDecoder::default(),
            sniffer: BinarySniffer::new(config.binary_sniff_bytes),
            output: String::new(),
            output_limit: options.background.then_some(BACKGROUND_OUTPUT_TAIL_BYTES),
            total_bytes: 0,
            binary_announced: false,
            kill_escalation: Duration::from_millis(config.kill_escalation_ms),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            scrubber,
        }
    }

    fn retain(&mut self, text: &str) {
        self.output.push_str(text);
        if let Some(limit) = self.output_limit
            && self.output.len() > limit
        {
            let mut cut = self.output.len() - limit;
            while !self.output.is_char_boundary(cut) {
                cut += 1;
            }
            self.output.drain(..cut);
        }
    }

    async fn run(
        mut self,
        mut child: Child,
        mut chunks: mpsc::Receiver<Chunk>,
        readers: Vec<JoinHandle<()>>,
        cancel: CancellationToken,
        pid: Option<u32>,
        probe: Option<DescendantProbe>,
    ) -> (ExecutionResult, mpsc::Sender<ExecutionEvent>) {
        let mut aborted = false;
        let mut pipes_open = true;
        let mut kill_deadline: Option<Pin<Box<Sleep>>> = None;

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !aborted => {
                    aborted = true;
                    info!(?pid, "cancellation requested; terminating process tree");
                    request_termination(&mut child, pid, KillSignal::Term);
                    kill_deadline = Some(Box::pin(sleep(self.kill_escalation)));
                }
                _ = async {
                    match kill_deadline.as_mut() {
                        Some(deadline) => deadline.as_mut().await,
                        None => pending::<()>().await,
                    }
                }, if kill_deadline.is_some() => {
                    kill_deadline = None;
                    debug!(?pid, "process tree still alive after SIGTERM; sending SIGKILL");
                    request_termination(&mut child, pid, KillSignal::Kill);
                }
                chunk = chunks.recv(), if pipes_open => match chunk {
                    Some((kind, bytes)) => self.handle_chunk(kind, &bytes).await,
                    None => pipes_open = false,
                },
                status = child.wait() => break status,
            }
        };

        let deadline = Instant::now() + self.drain_timeout;
        while pipes_open {
            match timeout_at(deadline, chunks.recv()).await {
                Ok(Some((kind, bytes))) => self.handle_chunk(kind, &bytes).await,
                Ok(None) => pipes_open = false,
                Err(_) => {
                    debug!(?pid, "output pipes still held open after exit; detaching readers");
                    break;
                }
            }
        }
        for reader in readers {
            reader.abort();
        }

        let snapshot = probe
            .as_ref()
            .map(|probe| probe.collect(pid, aborted))
            .unwrap_or_default();
        drop(probe);

        let result = self.finish(status, pid, aborted, snapshot.pids, snapshot.available);
        debug!(
            ?pid,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            aborted,
            bytes = result.raw_byte_count,
            "command finished"
        );
        (result, self.events_tx)
    }

    async fn handle_chunk(&mut self, kind: StreamKind, bytes: &[u8]) {
        self.total_bytes += bytes.len() as u64;

        if self.sniffer.observe(bytes) {
            if !self.binary_announced {
                self.binary_announced = true;
                self.emit(ExecutionEvent::BinaryDetected).await;
            }
            self.emit(ExecutionEvent::BinaryProgress {
                bytes_received: self.total_bytes,
            })
            .await;
            return;
        }

        let decoder = match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        let text = decoder.decode(bytes);
        if !text.is_empty() {
            self.retain(&text);
            self.emit(ExecutionEvent::Data { chunk: text }).await;
        }
    }

    async fn emit(&self, event: ExecutionEvent) {
        // A dropped receiver only means nobody is watching live output.
        let _ = self.events_tx.send(event).await;
    }

    fn finish(
        &mut self,
        status: std::io::Result<ExitStatus>,
        pid: Option<u32>,
        aborted: bool,
        descendant_pids: Vec<u32>,
        descendant_pids_available: bool,
    ) -> ExecutionResult {
        let binary_detected = self.sniffer.detected();
        let output = if binary_detected {
            format!(
                "[Binary output detected. Received {} bytes.]",
                self.total_bytes
            )
        } else {
            let tail = self.stdout.finish() + &self.stderr.finish();
            self.retain(&tail);
            std::mem::take(&mut self.output)
        };

        let (exit_code, signal, error) = match status {
            Ok(status) => (status.code(), exit_signal(status), None),
            Err(err) => {
                warn!(?pid, error = %err, "failed to wait for command");
                (None, None, Some(format!("failed to wait for command: {err}")))
            }
        };

        ExecutionResult {
            output: self.scrubber.scrub(&output).into_owned(),
            raw_byte_count: self.total_bytes,
            exit_code,
            signal,
            pid,
            aborted,
            cancel_reason: None,
            error: error.map(|error| self.scrubber.scrub(&error).into_owned()),
            binary_detected,
            descendant_pids,
            descendant_pids_available,
        }
    }
}

fn request_termination(child: &mut Child, pid: Option<u32>, signal: KillSignal) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if let Err(err) = process_group::signal_process_tree(pid, signal) {
            warn!(pid, ?signal, error = %err, "failed to signal process group");
        } else {
            return;
        }
    }

    #[cfg(not(unix))]
    let _ = (pid, signal);

    if let Err(err) = child.start_kill()
        && err.kind() != ErrorKind::InvalidInput
    {
        warn!(?pid, error = %err, "failed to kill child process");
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(ExecConfig::default())
    }

    async fn collect(handle: ExecutionHandle) -> (Vec<ExecutionEvent>, ExecutionResult) {
        let ExecutionHandle {
            mut events,
            completion,
            ..
        } = handle;
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        (seen, completion.wait().await.unwrap())
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let handle = engine().execute(
            "echo out; echo err 1>&2",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        assert!(handle.pid.is_some());
        let (events, result) = collect(handle).await;

        assert_eq!(result.exit_code, Some(0));
        assert!(!result.aborted);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
        assert!(
            events
                .iter()
                .all(|event| matches!(event, ExecutionEvent::Data { .. }))
        );
    }

    #[tokio::test]
    async fn non_zero_exit_code_is_reported() {
        let handle = engine().execute(
            "exit 3",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        let (_, result) = collect(handle).await;
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.signal, None);
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn binary_output_switches_to_progress_events() {
        let handle = engine().execute(
            r"printf 'ab\000cd'; printf 'more'",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        let (events, result) = collect(handle).await;

        assert!(result.binary_detected);
        assert!(result.output.starts_with("[Binary output detected."));
        let detected_at = events
            .iter()
            .position(|event| matches!(event, ExecutionEvent::BinaryDetected))
            .unwrap();
        assert!(
            events[detected_at + 1..]
                .iter()
                .all(|event| matches!(event, ExecutionEvent::BinaryProgress { .. }))
        );
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, ExecutionEvent::BinaryDetected))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn cancellation_resolves_with_aborted_result() {
        let cancel = CancellationToken::new();
        let handle = engine().execute(
            "sleep 30",
            Path::new("."),
            ExecOptions::default(),
            cancel.clone(),
        );
        let started = std::time::Instant::now();
        cancel.cancel();
        let (_, result) = collect(handle).await;

        assert!(result.aborted);
        assert_eq!(result.exit_code, None);
        assert!(result.signal.is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_in_band() {
        let handle = engine().execute(
            "echo hi",
            Path::new("/definitely/not/a/directory"),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        assert_eq!(handle.pid, None);
        let (events, result) = collect(handle).await;
        assert!(events.is_empty());
        assert!(result.error.is_some());
        assert_eq!(result.exit_code, None);
        assert!(!result.aborted);
    }

    #[tokio::test]
    async fn shell_diagnostics_never_mention_the_wrapper() {
        let handle = engine().execute(
            "echo (",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        let (_, result) = collect(handle).await;
        assert_ne!(result.exit_code, Some(0));
        assert!(!result.output.contains("shellwarden_pgrep_"));
        assert!(!result.output.contains("__code"));
    }

    #[tokio::test]
    async fn trailing_comment_keeps_the_command_intact() {
        let handle = engine().execute(
            "echo hi # say hello",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        let (_, result) = collect(handle).await;
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, "hi\n");
    }

    #[tokio::test]
    async fn heredoc_terminator_is_recognised() {
        let handle = engine().execute(
            "cat <<EOF\nhello\nEOF",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        let (_, result) = collect(handle).await;
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, "hello\n");
    }

    #[tokio::test]
    async fn live_chunks_scrub_to_the_user_command() {
        let handle = engine().execute(
            "echo (",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        let scrubber = handle.scrubber.clone();
        let (events, _) = collect(handle).await;
        let live: String = events
            .into_iter()
            .filter_map(|event| match event {
                ExecutionEvent::Data { chunk } => Some(chunk),
                _ => None,
            })
            .collect();
        let shown = scrubber.scrub(&live);
        assert!(!shown.contains("shellwarden_pgrep_"));
        assert!(!shown.contains("__code"));
    }

    #[tokio::test]
    async fn background_runs_keep_a_bounded_output_tail() {
        let handle = engine().execute(
            "head -c 200000 /dev/zero | tr '\\0' 'a'; echo end",
            Path::new("."),
            ExecOptions {
                background: true,
                ..ExecOptions::default()
            },
            CancellationToken::new(),
        );
        let (_, result) = collect(handle).await;
        assert_eq!(result.exit_code, Some(0));
        assert!(result.raw_byte_count > BACKGROUND_OUTPUT_TAIL_BYTES as u64);
        assert!(result.output.len() <= BACKGROUND_OUTPUT_TAIL_BYTES);
        assert!(result.output.ends_with("aend\n"));
    }

    #[tokio::test]
    async fn restricted_mode_strips_environment() {
        // SAFETY: test-local variable, read back only by the spawned child.
        unsafe { std::env::set_var("SHELLWARDEN_TEST_SECRET", "visible") };
        let handle = engine().execute(
            "echo \"secret=${SHELLWARDEN_TEST_SECRET:-}\"",
            Path::new("."),
            ExecOptions {
                restricted: true,
                ..ExecOptions::default()
            },
            CancellationToken::new(),
        );
        let (_, result) = collect(handle).await;
        assert_eq!(result.output.trim_end(), "secret=");
    }

    #[tokio::test]
    async fn backgrounded_children_are_reported_as_descendants() {
        let handle = engine().execute(
            "sleep 2 &",
            Path::new("."),
            ExecOptions::default(),
            CancellationToken::new(),
        );
        let pid = handle.pid;
        let (_, result) = collect(handle).await;

        assert_eq!(result.exit_code, Some(0));
        if result.descendant_pids_available {
            assert!(!result.descendant_pids.is_empty());
            assert!(!result.descendant_pids.contains(&pid.unwrap()));
        }
        let _ = process_group::signal_process_tree(pid.unwrap(), KillSignal::Kill);
    }
}
