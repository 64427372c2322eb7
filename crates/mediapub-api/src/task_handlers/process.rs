use anyhow::Context;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mediapub_core::models::{RpcRequest, RpcResponse, Task, UploadProcessPayload, UploadProcessResult};
use mediapub_core::TaskError;
use mediapub_processing::{AnalyzeError, Analyzed, Analyzer};
use mediapub_storage::{split, StorageError, Stream, UploadStorage, Uploader};
use mediapub_worker::{HandlerContext, RetryDelayFn, DEFAULT_RETRY_DELAY};

use super::ResultSink;
use crate::rpc::{RpcClient, RpcError};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to retrieve upload: {0}")]
    Retrieve(#[source] StorageError),

    #[error("failed to analyze upload: {0}")]
    Analyze(#[source] AnalyzeError),

    #[error("failed to split upload into blobs: {0}")]
    Split(#[source] StorageError),

    #[error("failed to upload blobs: {0}")]
    Upload(#[source] StorageError),

    #[error("{failed} of {total} blob uploads failed")]
    PartialUpload { failed: usize, total: usize },

    #[error("rpc call failed: {0}")]
    Rpc(#[source] RpcError),
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::PartialUpload { .. } => true,
            ProcessError::Rpc(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Backoff for `upload:process`: a partial blob upload waits one minute per
/// attempt so far, anything else the bus default.
pub fn process_retry_delay() -> RetryDelayFn {
    Arc::new(|attempt: u32, err: &anyhow::Error, _task: &Task| {
        let partial = err
            .downcast_ref::<TaskError>()
            .and_then(|te| match te {
                TaskError::Retryable(inner) | TaskError::SkipRetry(inner) => {
                    inner.downcast_ref::<ProcessError>()
                }
            })
            .or_else(|| err.downcast_ref::<ProcessError>())
            .is_some_and(|pe| matches!(pe, ProcessError::PartialUpload { .. }));
        if partial {
            Duration::from_secs(60 * u64::from(attempt.max(1)))
        } else {
            DEFAULT_RETRY_DELAY
        }
    })
}

/// Fill the request template with what processing learned about the file.
pub fn build_request(
    template: &RpcRequest,
    file_name: &str,
    analyzed: &Analyzed,
    stream: &Stream,
) -> RpcRequest {
    let mut request = template.clone();

    let file_name = if Path::new(file_name).extension().is_none() {
        format!("{file_name}{}", analyzed.extension())
    } else {
        file_name.to_string()
    };
    request.set_param("file_name", Value::from(file_name));
    request.set_param("file_size", Value::from(stream.manifest.size));
    request.set_param("file_hash", Value::from(stream.file_hash()));
    request.set_param("sd_hash", Value::from(stream.sd_hash.as_str()));
    if let Some(info) = analyzed.media_info {
        if info.width > 0 {
            request.set_param("width", Value::from(info.width));
        }
        if info.height > 0 {
            request.set_param("height", Value::from(info.height));
        }
        if info.duration > 0 {
            request.set_param("duration", Value::from(info.duration));
        }
    }
    request.remove_param("file_path");

    if request.param("claim_id").is_some() {
        request.method = "stream_update".to_string();
        request.remove_param("name");
        request.set_param("replace", Value::Bool(true));
    }
    request
}

/// Handler for `upload:process`: retrieve, analyze, split, upload, publish.
pub struct UploadProcessor {
    storage: Arc<dyn UploadStorage>,
    analyzer: Analyzer,
    uploader: Uploader,
    rpc: Arc<dyn RpcClient>,
    sink: Arc<dyn ResultSink>,
    blobs_dir: PathBuf,
}

impl UploadProcessor {
    pub fn new(
        storage: Arc<dyn UploadStorage>,
        analyzer: Analyzer,
        uploader: Uploader,
        rpc: Arc<dyn RpcClient>,
        sink: Arc<dyn ResultSink>,
        blobs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            analyzer,
            uploader,
            rpc,
            sink,
            blobs_dir: blobs_dir.into(),
        }
    }

    /// Every outcome is delivered to the result sink. Local blobs survive a
    /// retryable failure that still has attempts left.
    #[tracing::instrument(
        skip(self, ctx, payload),
        fields(task_id = %ctx.task_id, upload_id = %payload.upload_id, attempt = ctx.retried + 1)
    )]
    pub async fn handle(
        &self,
        ctx: HandlerContext,
        payload: UploadProcessPayload,
    ) -> anyhow::Result<()> {
        let mut result = UploadProcessResult::new(payload.upload_id.clone(), payload.user_id);
        let (stream, outcome) = self.run(&payload).await;
        if let Some(stream) = &stream {
            result.sd_hash = stream.sd_hash.clone();
        }

        match outcome {
            Ok(response) => {
                if let Some(err) = &response.error {
                    result.error = format!("sdk returned an error: {}", err.message);
                }
                result.response = Some(response);
                self.remove_blobs(stream.as_ref()).await;
                self.sink
                    .deliver(&result)
                    .await
                    .context("failed to deliver processing result")?;
                Ok(())
            }
            Err(err) if err.is_retryable() && !ctx.is_last_attempt() => {
                tracing::warn!(error = %err, "Processing failed, will retry");
                result.error = err.to_string();
                result.retry = true;
                if let Err(e) = self.sink.deliver(&result).await {
                    tracing::warn!(error = %e, "Failed to deliver retry notice");
                }
                Err(TaskError::retryable(err).into())
            }
            Err(err) => {
                tracing::error!(error = %err, "Processing failed permanently");
                result.error = err.to_string();
                self.remove_blobs(stream.as_ref()).await;
                self.sink
                    .deliver(&result)
                    .await
                    .context("failed to deliver processing failure")?;
                Err(TaskError::skip_retry(err).into())
            }
        }
    }

    async fn run(
        &self,
        payload: &UploadProcessPayload,
    ) -> (Option<Stream>, Result<RpcResponse, ProcessError>) {
        let file = match self.storage.retrieve(&payload.path).await {
            Ok(file) => file,
            Err(e) => return (None, Err(ProcessError::Retrieve(e))),
        };
        let file_name = Path::new(&payload.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| payload.upload_id.clone());

        let analyzed = match self.analyzer.analyze(file.path(), &file_name).await {
            Ok(analyzed) => analyzed,
            Err(e) => return (None, Err(ProcessError::Analyze(e))),
        };
        let stream = match split(file.path(), &self.blobs_dir).await {
            Ok(stream) => stream,
            Err(e) => return (None, Err(ProcessError::Split(e))),
        };

        let summary = match self.uploader.upload(&stream).await {
            Ok(summary) => summary,
            Err(e) => return (Some(stream), Err(ProcessError::Upload(e))),
        };
        if summary.has_failures() {
            let err = ProcessError::PartialUpload {
                failed: summary.failed,
                total: summary.total(),
            };
            return (Some(stream), Err(err));
        }

        let request = build_request(&payload.request, &file_name, &analyzed, &stream);
        tracing::debug!(method = %request.method, "Calling publishing RPC");
        let response = self
            .rpc
            .call(payload.user_id, &request)
            .await
            .map_err(ProcessError::Rpc);
        (Some(stream), response)
    }

    async fn remove_blobs(&self, stream: Option<&Stream>) {
        if let Some(stream) = stream {
            if let Err(e) = stream.remove_local().await {
                tracing::warn!(error = %e, dir = %stream.dir.display(), "Failed to remove local blobs");
            }
        }
    }
}
