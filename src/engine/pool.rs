// ABOUTME: Execution substrate running task bodies with bounded concurrency
// ABOUTME: Enforces per-task wall-clock budgets and classifies outcomes

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::flow::{RunContext, Work};

/// Result of one task-body execution. `TimedOut` is distinct from `Failed`:
/// a timed-out attempt is never retried.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Value),
    Failed(String),
    TimedOut(Duration),
}

/// Semaphore-bounded pool for task bodies. The engine places no ordering on
/// concurrent executions beyond permit availability.
pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    default_timeout: Duration,
}

impl ExecutionPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            default_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run one attempt of a task body within its wall-clock budget.
    pub async fn execute(
        &self,
        work: Arc<dyn Work>,
        ctx: &RunContext,
        inputs: Vec<Value>,
        budget: Option<Duration>,
    ) -> Outcome {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let budget = budget.unwrap_or(self.default_timeout);

        debug!(task_id = %ctx.task_id, attempt = ctx.attempt, "executing task body");

        match timeout(budget, work.run(ctx, inputs)).await {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(e)) => Outcome::Failed(format!("{e:#}")),
            Err(_) => {
                warn!(task_id = %ctx.task_id, ?budget, "task body exceeded its wall-clock budget");
                Outcome::TimedOut(budget)
            }
        }
    }
}
