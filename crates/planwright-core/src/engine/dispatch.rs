//! Task dispatch port for async-task mode.
//!
//! The engine registers the node's wait before calling `dispatch`, so a
//! worker that calls back immediately can never race the registration.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Work handed to an external task worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// The worker calls back with this id in the callback envelope.
    pub correlation_id: String,
    pub node_execution_id: Uuid,
    pub plan_execution_id: Uuid,
    pub step_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("task channel closed")]
    Closed,

    #[error("task rejected: {0}")]
    Rejected(String),
}

pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, request: TaskRequest) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// Object-safe version of [`TaskDispatcher`] with boxed futures.
pub trait TaskDispatcherDyn: Send + Sync {
    fn dispatch_boxed(
        &self,
        request: TaskRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + '_>>;
}

impl<T: TaskDispatcher> TaskDispatcherDyn for T {
    fn dispatch_boxed(
        &self,
        request: TaskRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + '_>> {
        Box::pin(self.dispatch(request))
    }
}

/// Type-erased task dispatcher.
pub struct BoxTaskDispatcher {
    inner: Box<dyn TaskDispatcherDyn + Send + Sync>,
}

impl BoxTaskDispatcher {
    pub fn new<T: TaskDispatcher + 'static>(dispatcher: T) -> Self {
        Self {
            inner: Box::new(dispatcher),
        }
    }

    pub async fn dispatch(&self, request: TaskRequest) -> Result<(), DispatchError> {
        self.inner.dispatch_boxed(request).await
    }
}

/// Feeds task requests into an in-process channel.
#[derive(Clone)]
pub struct ChannelTaskDispatcher {
    sender: mpsc::UnboundedSender<TaskRequest>,
}

impl ChannelTaskDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TaskRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TaskDispatcher for ChannelTaskDispatcher {
    async fn dispatch(&self, request: TaskRequest) -> Result<(), DispatchError> {
        self.sender.send(request).map_err(|_| DispatchError::Closed)
    }
}
