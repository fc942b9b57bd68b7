// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Exporter;
use crate::error::ExportError;
use async_trait::async_trait;
use opentelemetry_proto::tonic::{logs::v1::ResourceLogs, trace::v1::ResourceSpans};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tracing::debug;

/// Runs the inner exporter's start logic at most once. Later calls return the
/// cached outcome. Stopping is likewise done at most once, and only after a
/// successful start.
pub struct OnceStart<E> {
    inner: E,
    started: OnceCell<Result<(), String>>,
    stopped: AtomicBool,
}

impl<E: Exporter> OnceStart<E> {
    pub fn new(inner: E) -> Self {
        OnceStart {
            inner,
            started: OnceCell::new(),
            stopped: AtomicBool::new(false),
        }
    }

    fn start_error(&self, message: &str) -> ExportError {
        ExportError::StartFailed(self.inner.name().to_string(), message.to_string())
    }
}

#[async_trait]
impl<E: Exporter> Exporter for OnceStart<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&self) -> Result<(), ExportError> {
        let outcome = self
            .started
            .get_or_init(|| async {
                debug!("EXPORTER | Starting exporter {}", self.inner.name());
                self.inner.start().await.map_err(|e| e.to_string())
            })
            .await;
        outcome.as_ref().map_err(|message| self.start_error(message)).copied()
    }

    async fn stop(&self) -> Result<(), ExportError> {
        if !matches!(self.started.get(), Some(Ok(()))) {
            return Ok(());
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop().await
    }

    async fn upload_traces(&self, batch: &[ResourceSpans]) -> Result<(), ExportError> {
        match self.started.get() {
            Some(Ok(())) => self.inner.upload_traces(batch).await,
            Some(Err(message)) => Err(self.start_error(message)),
            None => Err(ExportError::NotStarted(self.inner.name().to_string())),
        }
    }

    async fn upload_logs(&self, batch: &[ResourceLogs]) -> Result<(), ExportError> {
        match self.started.get() {
            Some(Ok(())) => self.inner.upload_logs(batch).await,
            Some(Err(message)) => Err(self.start_error(message)),
            None => Err(ExportError::NotStarted(self.inner.name().to_string())),
        }
    }
}
