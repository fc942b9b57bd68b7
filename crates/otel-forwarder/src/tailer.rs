// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Follows a log file that another process is still writing.
//!
//! The file may not exist yet when tailing starts, so opening is retried a
//! bounded number of times. Once open, end of file only means the writer has
//! not caught up: the tailer waits and reads again until it is cancelled.
//! A trailing fragment without a newline is held back until it is completed.

use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailConfig {
    pub open_attempts: u32,
    pub open_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        TailConfig {
            open_attempts: 30,
            open_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Sleeps for `duration`. Returns false if cancelled first.
async fn wait(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}

async fn open_with_retry(
    path: &Path,
    cancel: &CancellationToken,
    config: &TailConfig,
) -> Option<File> {
    for attempt in 1..=config.open_attempts {
        match File::open(path).await {
            Ok(file) => {
                debug!("TAILER | Opened {} after {} attempt(s)", path.display(), attempt);
                return Some(file);
            }
            Err(e) => {
                if attempt == config.open_attempts {
                    debug!(
                        "TAILER | {} did not appear after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    );
                    return None;
                }
            }
        }
        if !wait(config.open_interval, cancel).await {
            return None;
        }
    }
    None
}

/// Strips the line terminator and returns the line, or `None` for blank lines.
fn complete_line(raw: &[u8]) -> Option<String> {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(String::from_utf8_lossy(line).into_owned())
}

/// Streams complete lines appended to `path` into `lines` until `cancel`
/// fires or the receiver goes away. A file that never appears is not an
/// error: the function simply returns.
pub async fn tail_file(
    path: &Path,
    lines: Sender<String>,
    cancel: CancellationToken,
    config: TailConfig,
) {
    let Some(file) = open_with_retry(path, &cancel, &config).await else {
        return;
    };
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                if !wait(config.poll_interval, &cancel).await {
                    break;
                }
            }
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    // Partial line at end of file. Keep it and read on.
                    continue;
                }
                let Some(line) = complete_line(&buf) else {
                    buf.clear();
                    continue;
                };
                buf.clear();
                let sent = tokio::select! {
                    () = cancel.cancelled() => break,
                    sent = lines.send(line) => sent,
                };
                if sent.is_err() {
                    debug!("TAILER | Line receiver closed, stopping");
                    break;
                }
            }
            Err(e) => {
                warn!("TAILER | Failed to read {}: {}", path.display(), e);
                break;
            }
        }
    }
    if !buf.is_empty() {
        debug!("TAILER | Dropping {} bytes of incomplete line", buf.len());
    }
}
