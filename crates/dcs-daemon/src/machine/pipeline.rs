//! The code pipeline: per-channel ordering, interception stages and the
//! executor seam behind which the firmware transport lives.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dcs_core::code::{Code, CodeChannel, CodeType, InterceptionStage, Message};
use dcs_core::error::IpcError;

use super::interceptors::{InterceptOutcome, InterceptorRegistry};

/// Seam to the motion controller. The transport that actually talks to the
/// firmware implements this; the daemon only needs "give me a result for
/// this code".
pub trait CodeExecutor: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        code: &'a Code,
    ) -> Pin<Box<dyn Future<Output = Result<Message, IpcError>> + Send + 'a>>;
}

/// Stand-in executor: acknowledges every code with an empty success
/// message, which is what an idle firmware does for most codes anyway.
/// Keeps the pipeline fully exercisable without a connected board.
pub struct FirmwareStub;

impl CodeExecutor for FirmwareStub {
    fn execute<'a>(
        &'a self,
        code: &'a Code,
    ) -> Pin<Box<dyn Future<Output = Result<Message, IpcError>> + Send + 'a>> {
        Box::pin(async move {
            debug!(event = "code_executed", code = %code, channel = ?code.channel);
            Ok(Message::success(""))
        })
    }
}

pub struct CodePipeline {
    channels: HashMap<CodeChannel, Arc<Mutex<()>>>,
    interceptors: Arc<InterceptorRegistry>,
    executor: Arc<dyn CodeExecutor>,
}

impl CodePipeline {
    pub fn new(interceptors: Arc<InterceptorRegistry>, executor: Arc<dyn CodeExecutor>) -> Self {
        let channels = CodeChannel::ALL
            .iter()
            .map(|channel| (*channel, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            channels,
            interceptors,
            executor,
        }
    }

    fn channel_gate(&self, channel: CodeChannel) -> Arc<Mutex<()>> {
        self.channels
            .get(&channel)
            .expect("every channel has a gate")
            .clone()
    }

    /// Route one code through interception and execution. Per-channel FIFO
    /// is established by the channel gate, which is held for the whole
    /// pipeline; interceptors issuing auxiliary codes should target a
    /// different channel than the one they are intercepting.
    pub async fn submit(
        &self,
        code: Code,
        cancel: &CancellationToken,
    ) -> Result<Message, IpcError> {
        let gate = self.channel_gate(code.channel);
        let _held = tokio::select! {
            held = gate.lock() => held,
            _ = cancel.cancelled() => return Err(IpcError::cancelled()),
        };

        // Comments have nothing to execute but still pass interception so
        // layer markers and the like can be observed.
        let executable = code.code_type != CodeType::Comment;

        match self
            .interceptors
            .intercept(InterceptionStage::PreCode, &code, cancel)
            .await?
        {
            InterceptOutcome::Continue => {}
            InterceptOutcome::Resolved(message) => return Ok(message),
            InterceptOutcome::Cancelled => return Err(IpcError::cancelled()),
        }

        match self
            .interceptors
            .intercept(InterceptionStage::PostCode, &code, cancel)
            .await?
        {
            InterceptOutcome::Continue => {}
            InterceptOutcome::Resolved(message) => return Ok(message),
            InterceptOutcome::Cancelled => return Err(IpcError::cancelled()),
        }

        let result = if executable {
            self.executor.execute(&code).await?
        } else {
            Message::success("")
        };

        let mut executed = code;
        executed.result = Some(result.clone());
        match self
            .interceptors
            .intercept(InterceptionStage::ExecutedCode, &executed, cancel)
            .await?
        {
            InterceptOutcome::Continue => Ok(result),
            InterceptOutcome::Resolved(message) => Ok(message),
            InterceptOutcome::Cancelled => Err(IpcError::cancelled()),
        }
    }

    /// Complete once the channel has no code in flight.
    pub async fn flush(
        &self,
        channel: CodeChannel,
        cancel: &CancellationToken,
    ) -> Result<(), IpcError> {
        let gate = self.channel_gate(channel);
        let _held = tokio::select! {
            held = gate.lock() => held,
            _ = cancel.cancelled() => return Err(IpcError::cancelled()),
        };
        Ok(())
    }
}
