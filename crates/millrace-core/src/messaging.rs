//! Message correlation across process instances.
//!
//! A send matches a receive by message name plus full correlation-key-set
//! equality, oldest receive first. At-most-once delivery rests on one CAS:
//! the `ready -> running` status claim commits before any delivery work,
//! so two workers sweeping the same send see exactly one winner.

use millrace_types::error::RepositoryError;
use millrace_types::message::{MessageInstance, MessageStatus, MessageType};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::contracts::ModelSource;
use crate::engine::{EngineError, LockError, WorkflowExecutionService};
use crate::repository::EngineRepository;

/// Initiator recorded on instances started by message correlation.
const MESSAGE_INITIATOR: &str = "message";

// ---------------------------------------------------------------------------
// Error and outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("message instance not found: {0}")]
    MessageNotFound(Uuid),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// What one correlation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// Payload delivered; both sides are completed.
    Delivered { send_id: Uuid, receive_id: Uuid },
    /// No matching receiver exists yet; the send stays ready.
    NoMatch,
    /// A matching receiver exists but cannot take delivery right now
    /// (instance locked or not accepting); the send was rolled back.
    Deferred,
    /// Another worker claimed one of the sides first.
    Contended,
}

/// One sweep over ready sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub unmatched: usize,
    pub deferred: usize,
    pub contended: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Matches ready sends to waiting receives and drives delivery through the
/// execution service.
pub struct CorrelationService<'a, R: EngineRepository, M: ModelSource> {
    engine: &'a WorkflowExecutionService<R, M>,
}

impl<'a, R: EngineRepository, M: ModelSource> CorrelationService<'a, R, M> {
    pub fn new(engine: &'a WorkflowExecutionService<R, M>) -> Self {
        Self { engine }
    }

    fn repo(&self) -> &R {
        self.engine.repo()
    }

    /// Attempt to correlate and deliver one ready send.
    pub async fn correlate(&self, send_id: &Uuid) -> Result<CorrelationOutcome, CorrelationError> {
        let repo = self.repo();
        let send = repo
            .get_message(send_id)
            .await?
            .ok_or(CorrelationError::MessageNotFound(*send_id))?;
        if send.status != MessageStatus::Ready {
            return Ok(CorrelationOutcome::Contended);
        }

        // The at-most-once gate: claim the send before anything else.
        if !repo
            .claim_message(send_id, MessageStatus::Ready, MessageStatus::Running)
            .await?
        {
            return Ok(CorrelationOutcome::Contended);
        }

        let receive = match self.find_receiver(&send).await? {
            Some(receive) => receive,
            None => {
                self.reset_to_ready(send).await?;
                return Ok(CorrelationOutcome::NoMatch);
            }
        };

        // The target must currently accept messages; suspended and
        // terminal instances defer the send to a later sweep.
        let target = repo.get_instance(&receive.process_instance_id).await?;
        let accepting = target.is_some_and(|i| i.status.accepts_messages());
        if !accepting {
            self.reset_to_ready(send).await?;
            return Ok(CorrelationOutcome::Deferred);
        }

        if !repo
            .claim_message(&receive.id, MessageStatus::Ready, MessageStatus::Running)
            .await?
        {
            self.reset_to_ready(send).await?;
            return Ok(CorrelationOutcome::Contended);
        }

        self.deliver(send, receive).await
    }

    /// One pass over all ready sends. Callers loop until a sweep delivers
    /// nothing to reach a fixed point.
    pub async fn run_sweep(&self) -> Result<SweepReport, CorrelationError> {
        let mut report = SweepReport::default();
        let sends = self
            .repo()
            .list_ready_messages(MessageType::Send, None)
            .await?;
        for send in sends {
            match self.correlate(&send.id).await {
                Ok(CorrelationOutcome::Delivered { .. }) => report.delivered += 1,
                Ok(CorrelationOutcome::NoMatch) => report.unmatched += 1,
                Ok(CorrelationOutcome::Deferred) => report.deferred += 1,
                Ok(CorrelationOutcome::Contended) => report.contended += 1,
                Err(err) => {
                    // Failure is recorded on the message rows; the sweep
                    // moves on to the next send.
                    tracing::warn!(send = %send.id, error = %err, "correlation failed");
                    report.failed += 1;
                }
            }
        }
        tracing::debug!(
            delivered = report.delivered,
            unmatched = report.unmatched,
            deferred = report.deferred,
            "correlation sweep finished"
        );
        Ok(report)
    }

    /// Oldest matching ready receive, starting a message-triggerable
    /// process when no instance is waiting yet.
    async fn find_receiver(
        &self,
        send: &MessageInstance,
    ) -> Result<Option<MessageInstance>, CorrelationError> {
        if let Some(receive) = self.match_ready_receive(send).await? {
            return Ok(Some(receive));
        }
        // No waiting receiver; a message start event may create one.
        let Some(model) = self.repo().find_message_triggerable(&send.name).await? else {
            return Ok(None);
        };
        tracing::info!(model = %model, name = %send.name, "starting message-triggered instance");
        self.engine
            .start_instance_for_message(&model, &send.name, MESSAGE_INITIATOR)
            .await?;
        self.match_ready_receive(send).await
    }

    async fn match_ready_receive(
        &self,
        send: &MessageInstance,
    ) -> Result<Option<MessageInstance>, CorrelationError> {
        // Ascending UUIDv7 order, so ties break toward the oldest receive.
        let candidates = self
            .repo()
            .list_ready_messages(MessageType::Receive, Some(&send.name))
            .await?;
        Ok(candidates.into_iter().find(|r| send.correlates_with(r)))
    }

    async fn deliver(
        &self,
        mut send: MessageInstance,
        mut receive: MessageInstance,
    ) -> Result<CorrelationOutcome, CorrelationError> {
        let payload = send.payload.clone().unwrap_or_else(|| json!({}));
        let delivery = self
            .engine
            .deliver_message(&receive.process_instance_id, &send.name, &payload)
            .await;

        match delivery {
            Ok(_) => {
                let now = chrono::Utc::now();
                send.status = MessageStatus::Completed;
                send.counterpart_id = Some(receive.id);
                send.updated_at = now;
                receive.status = MessageStatus::Completed;
                receive.counterpart_id = Some(send.id);
                receive.updated_at = now;
                let (send_id, receive_id) = (send.id, receive.id);
                self.repo().update_message(&send).await?;
                self.repo().update_message(&receive).await?;
                tracing::info!(send = %send_id, receive = %receive_id, name = %send.name, "message delivered");
                Ok(CorrelationOutcome::Delivered { send_id, receive_id })
            }
            Err(EngineError::Lock(LockError::InstanceLocked(_))) => {
                // Transient: the target is mid-cycle elsewhere. Both sides
                // go back to ready for a later sweep.
                self.reset_to_ready(receive).await?;
                self.reset_to_ready(send).await?;
                Ok(CorrelationOutcome::Deferred)
            }
            Err(err) => {
                let cause = err.to_string();
                self.mark_failed(send, &cause).await?;
                self.mark_failed(receive, &cause).await?;
                Err(err.into())
            }
        }
    }

    async fn reset_to_ready(&self, mut message: MessageInstance) -> Result<(), CorrelationError> {
        message.status = MessageStatus::Ready;
        message.updated_at = chrono::Utc::now();
        self.repo().update_message(&message).await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        mut message: MessageInstance,
        cause: &str,
    ) -> Result<(), CorrelationError> {
        message.status = MessageStatus::Failed;
        message.failure_cause = Some(cause.to_string());
        message.updated_at = chrono::Utc::now();
        self.repo().update_message(&message).await?;
        Ok(())
    }
}

/// Convenience for tests and callers delivering loose payloads: an empty
/// object when the send carried no payload.
pub fn payload_or_empty(message: &MessageInstance) -> Value {
    message.payload.clone().unwrap_or_else(|| json!({}))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
