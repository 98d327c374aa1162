//! Worker-side runtime for the subprocess line protocol.
//!
//! A worker binary implements [`Model`] and calls [`run_worker`]; the runtime
//! reads `job` lines from stdin, executes them according to the request's
//! [`JobMode`] and writes `dynamics`/`result` lines to stdout. Model code runs
//! on the blocking pool; a bounded channel between it and the stdout writer
//! throttles stepping when the coordinator reads slowly.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{WorkerJob, WorkerRequest, WorkerResponse};
use crate::job::{JobMode, JobRequest, Params};

/// Steps buffered ahead of the stdout writer.
const STEP_BUFFER: usize = 32;

/// Failure raised by model code. Reported to the coordinator as `{"error": ...}`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ModelError {
    message: String,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker pipe error: {0}")]
    Io(#[from] std::io::Error),
    #[error("job task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The three entry points a model exposes.
pub trait Model: Send + Sync + 'static {
    fn defaults(&self) -> Result<Params, ModelError>;

    /// Advance one step from `previous`. `Ok(None)` ends the stream early.
    fn step(&self, params: &Params, previous: Option<&Value>, t: u64)
    -> Result<Option<Value>, ModelError>;

    fn run(&self, params: &Params) -> Result<Value, ModelError>;

    /// Models without a step function answer streaming jobs with one `run`.
    fn has_step(&self) -> bool {
        true
    }
}

fn error_value(e: impl std::fmt::Display) -> Value {
    json!({ "error": e.to_string() })
}

fn introspect<M: Model + ?Sized>(model: &M) -> Result<Value, ModelError> {
    let defaults = model.defaults()?;
    let dynamics = if model.has_step() {
        model.step(&defaults, None, 0)?.unwrap_or(Value::Null)
    } else {
        json!({})
    };
    let result = model.run(&defaults)?;
    Ok(json!({
        "input_params": defaults,
        "dynamics_params": dynamics,
        "result_params": result,
    }))
}

fn sweep<'a, M: Model + ?Sized>(
    model: &M,
    request: &JobRequest,
    overrides: impl Iterator<Item = &'a Params>,
) -> Value {
    Value::Array(
        overrides
            .map(|o| {
                model
                    .run(&request.merged_params(o))
                    .unwrap_or_else(error_value)
            })
            .collect(),
    )
}

/// Execute one job, calling `emit` for every streamed step.
///
/// `emit` returns `false` once nobody is listening, which stops streaming.
/// Never fails: model errors become `{"error": ...}` values. In a sweep each
/// failing run yields its own error entry so positions stay aligned.
pub fn process_job<M, F>(model: &M, job: &WorkerJob, mut emit: F) -> Value
where
    M: Model + ?Sized,
    F: FnMut(Value) -> bool,
{
    let request = &job.request;
    match request.mode() {
        JobMode::Introspection => introspect(model).unwrap_or_else(error_value),
        JobMode::Sweep => sweep(model, request, request.variable_params.iter().flatten()),
        // normally split into sweeps by the coordinator
        JobMode::Batched => sweep(model, request, request.collection.iter().flatten().flatten()),
        JobMode::Streaming if !model.has_step() => model
            .run(&request.fixed_params)
            .unwrap_or_else(error_value),
        JobMode::Streaming => {
            let params = &request.fixed_params;
            let mut previous: Option<Value> = None;
            for t in 0..=request.target_steps() {
                match model.step(params, previous.as_ref(), t) {
                    Ok(Some(step)) => {
                        if !emit(step.clone()) {
                            break;
                        }
                        previous = Some(step);
                    }
                    Ok(None) => break,
                    Err(e) => return error_value(e),
                }
            }
            json!({})
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "model panicked".to_string())
}

/// Serve jobs from `reader`, answering on `writer`, until `reader` closes.
pub async fn run_worker_io<M, R, W>(
    model: Arc<M>,
    reader: R,
    writer: W,
) -> Result<(), WorkerError>
where
    M: Model,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, JsonLinesCodec::<WorkerRequest>::new());
    let mut responses = FramedWrite::new(writer, JsonLinesCodec::<WorkerResponse>::new());

    while let Some(msg) = requests.next().await {
        let WorkerRequest::Job { request: job } = msg?;
        let request_id = job.request.request_id.clone();
        tracing::debug!(%request_id, mode = %job.request.mode(), "Job received");

        let (tx, mut rx) = mpsc::channel::<WorkerResponse>(STEP_BUFFER);
        let model = Arc::clone(&model);
        let task = tokio::task::spawn_blocking(move || {
            let data = catch_unwind(AssertUnwindSafe(|| {
                process_job(model.as_ref(), &job, |step| {
                    tx.blocking_send(WorkerResponse::Dynamics { data: step })
                        .is_ok()
                })
            }))
            .unwrap_or_else(|payload| error_value(panic_message(payload.as_ref())));
            let _ = tx.blocking_send(WorkerResponse::Result { data });
        });

        while let Some(response) = rx.recv().await {
            responses.send(response).await?;
        }
        task.await?;
        tracing::debug!(%request_id, "Job finished");
    }

    tracing::debug!("Request stream closed, worker exiting");
    Ok(())
}

/// Serve jobs over stdin/stdout.
pub async fn run_worker<M: Model>(model: Arc<M>) -> Result<(), WorkerError> {
    run_worker_io(model, tokio::io::stdin(), tokio::io::stdout()).await
}
