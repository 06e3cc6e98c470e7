use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::command::{Command, CommandExecutor, CommandResult};
use crate::correlator::Outcome;

/// Code recorded when the command never produced a remote outcome, e.g. the
/// connection dropped or the request timed out.
pub const EXECUTION_FAILED: &str = "execution_failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkSuccess {
    pub index: usize,
    pub command: String,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkFailure {
    pub index: usize,
    pub command: String,
    pub error: ErrorDetail,
}

/// Per-command accounting for one bulk call. `total` always equals the number
/// of commands submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkResult {
    pub total: usize,
    pub successful: Vec<BulkSuccess>,
    pub failed: Vec<BulkFailure>,
}

impl BulkResult {
    fn collect(commands: &[Command], outcomes: Vec<Outcome>) -> Self {
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for (index, (command, outcome)) in commands.iter().zip(outcomes).enumerate() {
            let label = command.describe();
            match outcome {
                Ok(CommandResult::Success(result)) => successful.push(BulkSuccess {
                    index,
                    command: label,
                    result,
                }),
                Ok(CommandResult::Failure(remote)) => failed.push(BulkFailure {
                    index,
                    command: label,
                    error: ErrorDetail {
                        code: remote.code,
                        message: remote.message,
                    },
                }),
                Err(e) => failed.push(BulkFailure {
                    index,
                    command: label,
                    error: ErrorDetail {
                        code: EXECUTION_FAILED.into(),
                        message: e.to_string(),
                    },
                }),
            }
        }

        Self {
            total: commands.len(),
            successful,
            failed,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.successful.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} of {} commands succeeded, {} failed",
            self.succeeded(),
            self.total,
            self.failed_count()
        )
    }
}

/// Runs a batch of independent commands and reports every outcome.
pub struct BulkAggregator {
    executor: CommandExecutor,
}

impl BulkAggregator {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    /// Sends the commands in input order, pipelined on the one connection, and
    /// waits for all of them. A failing command never cancels the rest.
    pub async fn execute_bulk(&self, commands: &[Command]) -> BulkResult {
        let mut dispatched = Vec::with_capacity(commands.len());
        for command in commands {
            dispatched.push(self.executor.dispatch(command).await);
        }

        let outcomes = join_all(dispatched.into_iter().map(|sent| async move {
            match sent {
                Ok(handle) => self.executor.wait(handle).await,
                Err(e) => Err(e),
            }
        }))
        .await;

        let result = BulkResult::collect(commands, outcomes);
        tracing::info!(
            total = result.total,
            succeeded = result.succeeded(),
            failed = result.failed_count(),
            "bulk execution finished"
        );
        result
    }
}
