//! Local async-task worker.
//!
//! Consumes [`TaskRequest`]s from the channel dispatcher, runs each one on the
//! host and reports the outcome back through the engine's `notify` with the
//! task's correlation id. `shell` tasks run `sh -c <command>` under a timeout;
//! a timed-out task reports `failure_types: ["timeout"]`, which the engine
//! concludes as EXPIRED.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use planwright_core::engine::{ExecutionStrategy, TaskRequest};
use planwright_core::repository::{ExecutionRepository, InterruptRepository, WaitNotifyRepository};
use planwright_types::config::TaskSection;
use planwright_types::notify::NotifyPayload;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub struct LocalTaskWorker<R, W, I> {
    strategy: ExecutionStrategy<R, W, I>,
    max_concurrent_tasks: usize,
    default_timeout: Duration,
}

impl<R, W, I> LocalTaskWorker<R, W, I>
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    pub fn new(strategy: ExecutionStrategy<R, W, I>, config: &TaskSection) -> Self {
        Self {
            strategy,
            max_concurrent_tasks: config.max_concurrent_tasks.max(1),
            default_timeout: Duration::from_secs(config.default_timeout_secs.max(1)),
        }
    }

    /// Run tasks until `shutdown` fires or the dispatcher is dropped, then
    /// wait for in-flight tasks to report.
    pub async fn run(self, mut tasks: mpsc::UnboundedReceiver<TaskRequest>, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.max_concurrent_tasks));
        info!(max_concurrent_tasks = self.max_concurrent_tasks, "task worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                task = tasks.recv() => {
                    let Some(task) = task else { break };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                    let strategy = self.strategy.clone();
                    let default_timeout = self.default_timeout;
                    tracker.spawn(async move {
                        let payload = run_task(&task, default_timeout).await;
                        report(&strategy, &task, payload).await;
                        drop(permit);
                    });
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("task worker stopped");
    }
}

async fn report<R, W, I>(strategy: &ExecutionStrategy<R, W, I>, task: &TaskRequest, payload: NotifyPayload)
where
    R: ExecutionRepository + 'static,
    W: WaitNotifyRepository + 'static,
    I: InterruptRepository + 'static,
{
    let is_error = payload.is_error;
    match strategy.notify(&task.correlation_id, payload).await {
        Ok(true) => debug!(correlation_id = %task.correlation_id, is_error, "task result delivered"),
        Ok(false) => warn!(correlation_id = %task.correlation_id, "task result was already delivered"),
        Err(err) => warn!(correlation_id = %task.correlation_id, error = %err, "failed to deliver task result"),
    }
}

/// Execute one task and build the payload to notify with.
pub async fn run_task(task: &TaskRequest, default_timeout: Duration) -> NotifyPayload {
    match task.step_type.as_str() {
        "shell" => run_shell(&task.payload, default_timeout).await,
        other => NotifyPayload::error(json!({
            "message": format!("no local runner for step type '{other}'"),
            "failure_types": ["dispatch"],
        })),
    }
}

async fn run_shell(payload: &Value, default_timeout: Duration) -> NotifyPayload {
    let Some(command) = payload.get("command").and_then(Value::as_str) else {
        return NotifyPayload::error(json!({
            "message": "shell task has no command",
            "failure_types": ["application"],
        }));
    };
    let timeout = payload
        .get("timeout_secs")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = payload.get("working_dir").and_then(Value::as_str) {
        cmd.current_dir(dir);
    }

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return NotifyPayload::error(json!({
                "message": format!("failed to spawn shell: {err}"),
                "failure_types": ["application"],
            }));
        }
    };

    // Dropping the timed-out future drops the child, which kills it.
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => NotifyPayload::error(json!({
            "message": format!("command timed out after {}s", timeout.as_secs()),
            "failure_types": ["timeout"],
        })),
        Ok(Err(err)) => NotifyPayload::error(json!({
            "message": format!("failed to wait for command: {err}"),
            "failure_types": ["application"],
        })),
        Ok(Ok(output)) => NotifyPayload::ok(json!({
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        })),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::sqlite::{SqliteExecutionRepository, SqliteInterruptRepository, SqliteWaitNotifyRepository, test_pool};
    use planwright_core::engine::{BoxTaskDispatcher, ChannelTaskDispatcher, EngineRunner, PlanService};
    use planwright_core::event::EventBus;
    use planwright_types::execution::Status;
    use uuid::Uuid;

    fn shell(payload: Value) -> TaskRequest {
        TaskRequest {
            correlation_id: "task-1".into(),
            node_execution_id: Uuid::now_v7(),
            plan_execution_id: Uuid::now_v7(),
            step_type: "shell".into(),
            payload,
        }
    }

    #[tokio::test]
    async fn shell_task_reports_output() {
        let payload = run_task(&shell(json!({"command": "echo hello"})), Duration::from_secs(10)).await;
        assert!(!payload.is_error);
        assert_eq!(payload.data["exit_code"], json!(0));
        assert_eq!(payload.data["stdout"], json!("hello\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_a_transport_error() {
        let payload = run_task(&shell(json!({"command": "echo nope >&2; exit 3"})), Duration::from_secs(10)).await;
        assert!(!payload.is_error);
        assert_eq!(payload.data["exit_code"], json!(3));
        assert_eq!(payload.data["stderr"], json!("nope\n"));
    }

    #[tokio::test]
    async fn slow_task_times_out() {
        let payload = run_task(&shell(json!({"command": "sleep 5", "timeout_secs": 1})), Duration::from_secs(10)).await;
        assert!(payload.is_error);
        assert_eq!(payload.data["failure_types"], json!(["timeout"]));
    }

    #[tokio::test]
    async fn unknown_step_type_is_rejected() {
        let mut task = shell(json!({}));
        task.step_type = "http".into();
        let payload = run_task(&task, Duration::from_secs(1)).await;
        assert!(payload.is_error);
        assert_eq!(payload.data["failure_types"], json!(["dispatch"]));
    }

    const PIPELINE: &str = r#"
id: nightly
name: Nightly
root: pipeline
nodes:
  - id: pipeline
    type: section
    facilitator: { type: children }
    parameters:
      children: [compile]
  - id: compile
    type: shell
    facilitator: { type: async_task }
    parameters:
      command: "echo {{ inputs.target }}"
    advisers:
      - type: on_success
        next_node_id: package
  - id: package
    type: shell
    facilitator: { type: async_task }
    parameters:
      command: "exit 1"
"#;

    #[tokio::test]
    async fn sqlite_engine_runs_shell_pipeline() {
        let pool = test_pool().await;
        let (dispatcher, tasks) = ChannelTaskDispatcher::channel();
        let (strategy, jobs) = ExecutionStrategy::new(
            Arc::new(SqliteExecutionRepository::new(pool.clone())),
            Arc::new(SqliteWaitNotifyRepository::new(pool.clone())),
            Arc::new(SqliteInterruptRepository::new(pool)),
            BoxTaskDispatcher::new(dispatcher),
            EventBus::new(64),
        );
        let shutdown = CancellationToken::new();
        tokio::spawn(EngineRunner::new(strategy.clone(), 4, None).run(jobs, shutdown.clone()));
        tokio::spawn(LocalTaskWorker::new(strategy.clone(), &TaskSection::default()).run(tasks, shutdown.clone()));

        let service = PlanService::new(strategy.clone());
        let plan = service.register_plan(PIPELINE).await.unwrap();
        let execution = service
            .start_plan(&plan.id, json!({"target": "arm64"}), BTreeMap::new())
            .await
            .unwrap();

        let mut status = Status::Queued;
        for _ in 0..200 {
            status = service.get_execution(&execution.id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        shutdown.cancel();

        assert_eq!(status, Status::Failed);
        let nodes = service.list_nodes(&execution.id).await.unwrap();
        let compile = nodes.iter().find(|n| n.node_id == "compile").unwrap();
        assert_eq!(compile.status, Status::Succeeded);
        assert_eq!(compile.outputs.as_ref().unwrap()["stdout"], json!("arm64\n"));
        let package = nodes.iter().find(|n| n.node_id == "package").unwrap();
        assert_eq!(package.status, Status::Failed);
        assert_eq!(package.previous_id, Some(compile.id));
    }
}
