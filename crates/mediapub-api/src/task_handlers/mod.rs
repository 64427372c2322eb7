//! Task bus handlers for upload processing and its results.

mod process;
mod result;

pub use process::{build_request, process_retry_delay, ProcessError, UploadProcessor};
pub use result::ResultRecorder;

use async_trait::async_trait;
use std::sync::Arc;

use mediapub_core::models::{UploadProcessPayload, UploadProcessResult};
use mediapub_worker::{BrokerResult, HandlerContext, ResultChannel, TaskBus};

/// Where [`UploadProcessor`] delivers its outcome.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: &UploadProcessResult) -> anyhow::Result<()>;
}

/// Puts the result on the bus as an `upload:process:result` task.
pub struct BusResultSink {
    channel: ResultChannel<UploadProcessResult>,
}

impl BusResultSink {
    pub fn new(channel: ResultChannel<UploadProcessResult>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ResultSink for BusResultSink {
    async fn deliver(&self, result: &UploadProcessResult) -> anyhow::Result<()> {
        self.channel.send(&result.upload_id, result).await?;
        Ok(())
    }
}

/// Persists the result in-process, skipping the bus round trip.
pub struct DirectResultSink {
    recorder: Arc<ResultRecorder>,
}

impl DirectResultSink {
    pub fn new(recorder: Arc<ResultRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl ResultSink for DirectResultSink {
    async fn deliver(&self, result: &UploadProcessResult) -> anyhow::Result<()> {
        self.recorder.record(result).await?;
        Ok(())
    }
}

/// Register both upload handlers on `bus`.
pub fn register_handlers(
    bus: &TaskBus,
    processor: Arc<UploadProcessor>,
    recorder: Arc<ResultRecorder>,
) -> BrokerResult<()> {
    bus.add_handler_with_retry_delay::<UploadProcessPayload, _, _>(
        move |ctx: HandlerContext, payload: UploadProcessPayload| {
            let processor = processor.clone();
            async move { processor.handle(ctx, payload).await }
        },
        process_retry_delay(),
    )?;
    bus.add_handler::<UploadProcessResult, _, _>(
        move |_ctx: HandlerContext, result: UploadProcessResult| {
            let recorder = recorder.clone();
            async move {
                recorder.record(&result).await?;
                Ok(())
            }
        },
    )?;
    Ok(())
}
