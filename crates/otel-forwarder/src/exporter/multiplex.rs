// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::Exporter;
use crate::error::ExportError;
use async_trait::async_trait;
use futures::future::join_all;
use opentelemetry_proto::tonic::{logs::v1::ResourceLogs, trace::v1::ResourceSpans};
use std::future::Future;
use std::sync::Arc;

/// Fans every operation out to all exporters concurrently. All of them are
/// awaited and their errors are combined; one failure never prevents the
/// others from running.
pub struct Multiplexer {
    name: String,
    exporters: Vec<Arc<dyn Exporter>>,
}

impl Multiplexer {
    #[must_use]
    pub fn new(exporters: Vec<Arc<dyn Exporter>>) -> Self {
        let name = exporters
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(",");
        Multiplexer { name, exporters }
    }

    async fn dispatch<'a, F, Fut>(&'a self, operation: F) -> Result<(), ExportError>
    where
        F: Fn(&'a Arc<dyn Exporter>) -> Fut,
        Fut: Future<Output = Result<(), ExportError>>,
    {
        let errors = join_all(self.exporters.iter().map(operation))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        ExportError::aggregate(errors).map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Exporter for Multiplexer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ExportError> {
        self.dispatch(|e| e.start()).await
    }

    async fn stop(&self) -> Result<(), ExportError> {
        self.dispatch(|e| e.stop()).await
    }

    async fn upload_traces(&self, batch: &[ResourceSpans]) -> Result<(), ExportError> {
        self.dispatch(|e| e.upload_traces(batch)).await
    }

    async fn upload_logs(&self, batch: &[ResourceLogs]) -> Result<(), ExportError> {
        self.dispatch(|e| e.upload_logs(batch)).await
    }
}
