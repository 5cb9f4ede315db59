//! Typed handler seam: business modules implement [`Job`] per job type
//! and register it; the queue core never inspects payload semantics.

use crate::error::Result;
use crate::store::JobId;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Context passed to job execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    /// Execution attempt, 1-based.
    pub attempt: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A job that can be executed.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// The job type discriminator stored on each row.
    const NAME: &'static str;

    /// Dependency key of the external service this handler calls, if any.
    /// Jobs with a dependency are gated by the circuit breaker and rate
    /// limiter for that key.
    const DEPENDENCY: Option<&'static str> = None;

    /// The data required by the job.
    type Data: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<()>;
}

/// A type-erased job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn dependency(&self) -> Option<&str> {
        None
    }

    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<()>;
}

#[async_trait]
impl<J: Job> JobHandler for J {
    fn dependency(&self) -> Option<&str> {
        J::DEPENDENCY
    }

    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<()> {
        let data: J::Data = serde_json::from_value(payload)?;
        self.execute(ctx, data).await
    }
}

/// Registry mapping `job_type -> handler`, built before workers start.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its [`Job::NAME`].
    pub fn register<J: Job>(&mut self, job: J) -> &mut Self {
        self.handlers.insert(J::NAME.to_string(), Arc::new(job));
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
