use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::AppError;
use crate::job::Job;

/// What a callback knows about the attempt it is processing.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// The job as selected, before this attempt's outcome is recorded.
    pub job: Job,
}

impl ProcessContext {
    pub fn url(&self) -> &str {
        &self.job.url
    }
}

type Callback<T> = dyn Fn(ProcessContext, T) -> BoxFuture<'static, Result<(), AppError>> + Send + Sync;

/// A stage's processing callback, typed by how the payload is decoded.
///
/// Returning an error marks the attempt as failed.
#[derive(Clone)]
pub enum Processor {
    Bytes(Arc<Callback<Vec<u8>>>),
    /// Payload decoded as UTF-8, invalid sequences replaced.
    Text(Arc<Callback<String>>),
    /// Payload parsed as JSON; a parse failure fails the attempt.
    Json(Arc<Callback<serde_json::Value>>),
}

impl Processor {
    pub fn bytes<F, Fut>(f: F) -> Self
    where
        F: Fn(ProcessContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        Processor::Bytes(Arc::new(move |ctx: ProcessContext, body: Vec<u8>| {
            f(ctx, body).boxed()
        }))
    }

    pub fn text<F, Fut>(f: F) -> Self
    where
        F: Fn(ProcessContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        Processor::Text(Arc::new(move |ctx: ProcessContext, body: String| {
            f(ctx, body).boxed()
        }))
    }

    pub fn json<F, Fut>(f: F) -> Self
    where
        F: Fn(ProcessContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        Processor::Json(Arc::new(
            move |ctx: ProcessContext, body: serde_json::Value| f(ctx, body).boxed(),
        ))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Processor::Bytes(_) => "bytes",
            Processor::Text(_) => "text",
            Processor::Json(_) => "json",
        }
    }

    /// Decode `body` for this callback and run it.
    pub async fn invoke(&self, ctx: ProcessContext, body: &[u8]) -> Result<(), AppError> {
        match self {
            Processor::Bytes(f) => f(ctx, body.to_vec()).await,
            Processor::Text(f) => f(ctx, String::from_utf8_lossy(body).into_owned()).await,
            Processor::Json(f) => {
                let value = serde_json::from_slice(body)?;
                f(ctx, value).await
            }
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Processor::{}", self.kind())
    }
}
