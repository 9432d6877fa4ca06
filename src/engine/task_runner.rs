// ABOUTME: Advances a single task run by one lifecycle step
// ABOUTME: Evaluates the trigger, executes the body, and classifies the outcome

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::error::Result;
use super::pool::{ExecutionPool, Outcome};
use super::sync::{Proposal, StateSync, TaskRunHandle};
use crate::flow::{RunContext, Task};
use crate::state::State;

/// Executes one lifecycle step for one task run. Exactly one task-body
/// execution per attempt and at most two accepted transitions per step
/// (`Running`, then the classified result); a conflict at either point
/// adopts the remote state and aborts the step.
pub struct TaskRunner<'a> {
    sync: &'a StateSync,
    pool: &'a ExecutionPool,
}

impl<'a> TaskRunner<'a> {
    pub fn new(sync: &'a StateSync, pool: &'a ExecutionPool) -> Self {
        Self { sync, pool }
    }

    /// Advance `run` by one step. `upstream` holds the states of the task's
    /// dependencies in edge order; the flow runner guarantees they are all
    /// finished before dispatching.
    pub async fn run_one(
        &self,
        task: &Task,
        run: &mut TaskRunHandle,
        upstream: &[State],
    ) -> Result<()> {
        // re-invocation after a partial failure is a no-op
        if run.state.is_finished() {
            debug!(task_id = %task.id, state = %run.state, "task run already finished");
            return Ok(());
        }

        // a Running record belongs to another executor; leave it alone
        if !run.state.is_pending() {
            debug!(task_id = %task.id, "task run owned by another executor");
            return Ok(());
        }

        let attempt = match &run.state {
            State::Retrying {
                start_time,
                run_count,
            } => {
                if *start_time > Utc::now() {
                    debug!(task_id = %task.id, %start_time, "retry delay has not elapsed");
                    return Ok(());
                }
                run_count + 1
            }
            _ => 1,
        };

        if !task.trigger.evaluate(upstream) {
            let message = format!("trigger '{}' rejected upstream states", task.trigger);
            info!(task_id = %task.id, "{message}");
            self.sync
                .propose_task(run, State::TriggerFailed { message })
                .await?;
            return Ok(());
        }

        if self.sync.propose_task(run, State::Running).await? == Proposal::Superseded {
            return Ok(());
        }

        let inputs: Vec<Value> = upstream
            .iter()
            .map(|s| s.result().cloned().unwrap_or(Value::Null))
            .collect();
        let ctx = RunContext {
            flow_run_id: run.flow_run_id.clone(),
            task_run_id: run.id.clone(),
            task_id: task.id.clone(),
            map_index: run.map_index,
            attempt,
        };

        let outcome = self
            .pool
            .execute(task.work(), &ctx, inputs, task.timeout)
            .await;

        let next = match outcome {
            Outcome::Completed(result) => State::Success { result },
            Outcome::TimedOut(budget) => State::TimedOut {
                message: format!("exceeded the {budget:?} wall-clock budget"),
            },
            Outcome::Failed(message) => {
                if attempt <= task.max_retries {
                    let start_time = Utc::now()
                        + chrono::Duration::from_std(task.retry_delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    info!(
                        task_id = %task.id,
                        attempt,
                        max_retries = task.max_retries,
                        "attempt failed, scheduling retry"
                    );
                    State::Retrying {
                        start_time,
                        run_count: attempt,
                    }
                } else {
                    State::Failed { message }
                }
            }
        };

        self.sync.propose_task(run, next).await?;
        Ok(())
    }
}
