// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Run lifecycle around the wrapped command.
//!
//! ```text
//!   Idle ──> Running ──(command exits)──> Draining ──> Done
//! ```
//!
//! While the command runs, the tailer feeds a bounded line queue and a flush
//! loop decodes and forwards buffered lines. When the command exits the tailer
//! is cancelled, which closes the queue and triggers one final flush. Nothing
//! in the pipeline changes the exit code: a failure there is only logged.

use crate::config::Config;
use crate::decoder::{unix_nanos_now, Decoder};
use crate::forwarder::{build_forwarders, Forwarder};
use crate::tailer::{tail_file, TailConfig};
use futures::future::join_all;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Exit code when no command was given or it could not be started.
pub const EXIT_CODE_NOT_STARTED: i32 = 127;

pub const ENV_OTEL_FILE_NAME: &str = "DBT_OTEL_FILE_NAME";
pub const ENV_LOG_PATH: &str = "DBT_LOG_PATH";

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Pause after the command exits so its last writes reach the tailer.
    pub settle_delay: Duration,
    pub tail: TailConfig,
    pub stop_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            queue_capacity: 1000,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            settle_delay: Duration::from_millis(100),
            tail: TailConfig::default(),
            stop_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunParams {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub log_path: PathBuf,
    pub otel_file: String,
    pub service_name: String,
    pub flush_timeout: Duration,
    pub config: Config,
    pub settings: PipelineSettings,
}

impl RunParams {
    #[must_use]
    pub fn new(command: Vec<String>, config: Config) -> Self {
        RunParams {
            command,
            log_path: PathBuf::from("logs"),
            otel_file: "otel.jsonl".to_string(),
            service_name: crate::DEFAULT_SERVICE_NAME.to_string(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            config,
            settings: PipelineSettings::default(),
        }
    }

    /// The tailed file: `otel_file` itself when absolute, otherwise joined
    /// onto `log_path`.
    #[must_use]
    pub fn otel_file_path(&self) -> PathBuf {
        let file = Path::new(&self.otel_file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.log_path.join(file)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Draining,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Done => "done",
        };
        f.write_str(name)
    }
}

pub struct App {
    params: RunParams,
    state: RunState,
}

impl App {
    #[must_use]
    pub fn new(params: RunParams) -> Self {
        App {
            params,
            state: RunState::Idle,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!("APP | {} -> {}", self.state, next);
        self.state = next;
    }

    /// Runs the command to completion and returns the exit code to report.
    /// Cancelling `shutdown` kills the command; the pipeline still drains.
    pub async fn run(mut self, shutdown: CancellationToken) -> i32 {
        let Some(program) = self.params.command.first().cloned() else {
            error!("APP | No command given");
            return EXIT_CODE_NOT_STARTED;
        };
        let mut command = Command::new(&program);
        command.args(&self.params.command[1..]);
        self.inject_env(&mut command);

        let settings = self.params.settings;
        let path = self.params.otel_file_path();
        let cutoff = unix_nanos_now();

        self.transition(RunState::Running);
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let tail_cancel = shutdown.child_token();
        let tailer = tokio::spawn({
            let path = path.clone();
            let cancel = tail_cancel.clone();
            async move { tail_file(&path, tx, cancel, settings.tail).await }
        });
        let pipeline = tokio::spawn(flush_loop(
            rx,
            self.params.config.clone(),
            self.params.service_name.clone(),
            settings,
            cutoff,
        ));
        debug!(
            "APP | Running {} with telemetry from {}",
            program,
            path.display()
        );

        let exit_code = match command.spawn() {
            Ok(mut child) => {
                let status = tokio::select! {
                    status = child.wait() => status,
                    () = shutdown.cancelled() => {
                        warn!("APP | Interrupted, stopping {}", program);
                        if let Err(e) = child.kill().await {
                            warn!("APP | Failed to kill {}: {}", program, e);
                        }
                        child.wait().await
                    }
                };
                match status {
                    Ok(status) => exit_code_of(status),
                    Err(e) => {
                        error!("APP | Failed to wait for {}: {}", program, e);
                        EXIT_CODE_NOT_STARTED
                    }
                }
            }
            Err(e) => {
                error!("APP | Failed to start {}: {}", program, e);
                EXIT_CODE_NOT_STARTED
            }
        };
        debug!("APP | Command exited with code {}", exit_code);

        sleep(settings.settle_delay).await;
        tail_cancel.cancel();
        self.transition(RunState::Draining);

        if let Err(e) = tailer.await {
            warn!("APP | Tailer task failed: {}", e);
        }
        match timeout(self.params.flush_timeout, pipeline).await {
            Ok(Ok(forwarders)) => {
                debug!("APP | Final flush complete");
                stop_forwarders(&forwarders, settings.stop_timeout).await;
            }
            Ok(Err(e)) => warn!("APP | Flush task failed: {}", e),
            Err(_) => warn!(
                "APP | Final flush did not finish within {:?}, exiting anyway",
                self.params.flush_timeout
            ),
        }

        self.transition(RunState::Done);
        exit_code
    }

    fn inject_env(&self, command: &mut Command) {
        let injected = [
            (ENV_OTEL_FILE_NAME, self.params.otel_file.clone()),
            (
                ENV_LOG_PATH,
                self.params.log_path.to_string_lossy().into_owned(),
            ),
        ];
        for (name, value) in injected {
            if std::env::var_os(name).is_none() {
                command.env(name, value);
            }
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Buffers lines and flushes them when the batch is full, when the interval
/// elapses, and once more when the queue closes. Forwarders are built here,
/// while the wrapped command is already running, and handed back for shutdown.
async fn flush_loop(
    mut lines: mpsc::Receiver<String>,
    config: Config,
    service_name: String,
    settings: PipelineSettings,
    cutoff: u64,
) -> Vec<Forwarder> {
    let forwarders = build_forwarders(&config, &service_name).await;
    let mut decoder = Decoder::new();
    let mut buffer = Vec::with_capacity(settings.batch_size);
    let mut ticker = interval_at(
        Instant::now() + settings.flush_interval,
        settings.flush_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                buffer.push(line);
                if buffer.len() >= settings.batch_size {
                    flush(&mut decoder, &mut buffer, &forwarders, cutoff).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&mut decoder, &mut buffer, &forwarders, cutoff).await;
                }
            }
        }
    }
    flush(&mut decoder, &mut buffer, &forwarders, cutoff).await;

    let pending = decoder.pending_spans();
    if pending > 0 {
        debug!(
            "APP | {} span(s) never ended and were not exported",
            pending
        );
    }
    forwarders
}

async fn flush(
    decoder: &mut Decoder,
    buffer: &mut Vec<String>,
    forwarders: &[Forwarder],
    cutoff: u64,
) {
    if buffer.is_empty() {
        return;
    }
    let lines = std::mem::take(buffer);
    let (spans, logs) = decoder.decode_lines(&lines, cutoff);
    if spans.is_empty() && logs.is_empty() {
        return;
    }
    debug!(
        "APP | Flushing {} span(s) and {} log(s) from {} line(s)",
        spans.len(),
        logs.len(),
        lines.len()
    );

    join_all(forwarders.iter().map(|forwarder| {
        let spans = &spans;
        let logs = &logs;
        async move {
            let (traces_result, logs_result) =
                tokio::join!(forwarder.upload_traces(spans), forwarder.upload_logs(logs));
            if let Err(e) = traces_result {
                warn!(
                    "APP | {}: failed to upload {} span(s): {}",
                    forwarder.name(),
                    spans.len(),
                    e
                );
            }
            if let Err(e) = logs_result {
                warn!(
                    "APP | {}: failed to upload {} log(s): {}",
                    forwarder.name(),
                    logs.len(),
                    e
                );
            }
        }
    }))
    .await;
}

async fn stop_forwarders(forwarders: &[Forwarder], stop_timeout: Duration) {
    if forwarders.is_empty() {
        return;
    }
    let stopped = timeout(
        stop_timeout,
        join_all(forwarders.iter().map(Forwarder::stop)),
    )
    .await;
    match stopped {
        Ok(results) => {
            for (forwarder, result) in forwarders.iter().zip(results) {
                if let Err(e) = result {
                    warn!("APP | Failed to stop {}: {}", forwarder.name(), e);
                }
            }
        }
        Err(_) => warn!("APP | Stopping forwarders timed out after {:?}", stop_timeout),
    }
}
