//! Wait/notify registry trait definition.
//!
//! The registry is the durable "pending continuation" store. Payloads are
//! delivered per correlation id; a wait becomes ready once every one of its
//! correlation ids has a payload, and `claim` hands it to exactly one caller.

use std::future::Future;

use planwright_types::error::RepositoryError;
use planwright_types::notify::{ClaimedWait, NotifyPayload, WaitInstance};
use uuid::Uuid;

pub trait WaitNotifyRepository: Send + Sync {
    /// Persist a pending wait and index its correlation ids.
    fn register_wait(
        &self,
        wait: &WaitInstance,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Store a payload for `correlation_id`.
    ///
    /// The first payload wins; returns `false` for a duplicate delivery.
    fn deliver(
        &self,
        correlation_id: &str,
        payload: &NotifyPayload,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Pending waits on `correlation_id` whose every id has a payload.
    fn ready_waits(
        &self,
        correlation_id: &str,
    ) -> impl Future<Output = Result<Vec<WaitInstance>, RepositoryError>> + Send;

    /// Atomically move a ready wait from pending to claimed.
    ///
    /// Only the first claimant receives `Some`; everyone else gets `None`.
    fn claim(
        &self,
        wait_id: &Uuid,
    ) -> impl Future<Output = Result<Option<ClaimedWait>, RepositoryError>> + Send;

    /// Ready but unclaimed waits across all plans, oldest first.
    fn list_ready_waits(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WaitInstance>, RepositoryError>> + Send;

    /// Discard every pending wait owned by a node. Returns how many were discarded.
    fn discard_waits(
        &self,
        node_execution_id: &Uuid,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Pending waits owned by a node.
    fn pending_waits(
        &self,
        node_execution_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<WaitInstance>, RepositoryError>> + Send;
}
