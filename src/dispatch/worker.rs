//! # Worker
//!
//! One worker task per configured execution slot. A worker owns no
//! cross-query state: it pulls one work order at a time off its bus queue,
//! runs it through the executor seam, reports a completion to whoever sent
//! the order, and goes back to waiting. A poison message is the only exit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use crate::bus::{Address, AnnotatedMessage, ClientId, MessageBus, MessageStyle, DEFAULT_PRIORITY};
use crate::error::Result;

use super::messages::{
    self, RebuildWorkOrderCompleteMessage, RebuildWorkOrderMessage, WorkOrderCompleteMessage,
    WorkOrderError, WorkOrderMessage,
};

/// Result of executing one work order. `new_blocks` and `feedback` become
/// separate upstream messages when present.
#[derive(Debug, Default)]
pub struct WorkOrderOutcome {
    pub result: Option<serde_json::Value>,
    pub new_blocks: Vec<(u64, u64)>,
    pub feedback: Option<serde_json::Value>,
}

/// Execution-engine seam. Implementations run the opaque work-order body;
/// failures come back as values so a bad order never kills the worker task.
#[async_trait]
pub trait WorkOrderExecutor: Send + Sync {
    async fn execute(
        &self,
        work_order: &WorkOrderMessage,
    ) -> std::result::Result<WorkOrderOutcome, WorkOrderError>;

    async fn execute_rebuild(
        &self,
        work_order: &RebuildWorkOrderMessage,
    ) -> std::result::Result<(), WorkOrderError>;
}

/// A single execution slot bound to a bus client.
pub struct Worker {
    bus: Arc<dyn MessageBus>,
    client_id: ClientId,
    worker_thread_index: usize,
    executor: Arc<dyn WorkOrderExecutor>,
}

impl Worker {
    /// Connects a fresh bus client and registers the worker's message
    /// vocabulary.
    pub async fn connect(
        bus: Arc<dyn MessageBus>,
        worker_thread_index: usize,
        executor: Arc<dyn WorkOrderExecutor>,
    ) -> Result<Self> {
        let client_id = bus.connect().await?;
        for message_type in [
            messages::WORK_ORDER,
            messages::REBUILD_WORK_ORDER,
            messages::POISON,
        ] {
            bus.register_client_as_receiver(client_id, message_type)
                .await?;
        }
        for message_type in [
            messages::WORK_ORDER_COMPLETE,
            messages::REBUILD_WORK_ORDER_COMPLETE,
            messages::WORK_ORDER_FEEDBACK,
            messages::CATALOG_RELATION_NEW_BLOCK,
            messages::DATA_PIPELINE,
        ] {
            bus.register_client_as_sender(client_id, message_type)
                .await?;
        }
        Ok(Self {
            bus,
            client_id,
            worker_thread_index,
            executor,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Spawns the worker loop onto the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Receives and executes work orders until poisoned.
    #[instrument(skip(self), fields(worker = self.worker_thread_index, client = self.client_id))]
    pub async fn run(self) -> Result<()> {
        info!("worker started");
        loop {
            let envelope = self.bus.receive(self.client_id, 0, true).await?;
            match envelope.message.message_type {
                messages::POISON => {
                    info!("worker received poison, shutting down");
                    break;
                }
                messages::WORK_ORDER => self.handle_work_order(&envelope).await?,
                messages::REBUILD_WORK_ORDER => self.handle_rebuild(&envelope).await?,
                other => {
                    error!(message_type = other, "worker received unroutable message");
                }
            }
        }
        self.bus.disconnect(self.client_id).await?;
        Ok(())
    }

    async fn handle_work_order(&self, envelope: &AnnotatedMessage) -> Result<()> {
        let order: WorkOrderMessage = messages::decode(messages::WORK_ORDER, &envelope.message)?;
        debug!(
            query_id = order.query_id,
            operator = order.operator_index,
            correlation_id = %order.correlation_id,
            "executing work order"
        );

        let reply_to = Address::to(envelope.sender);
        let (result, error) = match self.executor.execute(&order).await {
            Ok(outcome) => {
                self.report_side_channels(&order, &outcome, &reply_to).await?;
                (outcome.result, None)
            }
            Err(work_order_error) => {
                crate::logging::log_error(
                    "worker",
                    "execute_work_order",
                    &work_order_error.message,
                    Some(&format!("query {}", order.query_id)),
                );
                (None, Some(work_order_error))
            }
        };

        let completion = WorkOrderCompleteMessage {
            query_id: order.query_id,
            operator_index: order.operator_index,
            worker_thread_index: self.worker_thread_index,
            result,
            error,
        };
        self.bus
            .send(
                self.client_id,
                &reply_to,
                &MessageStyle::default(),
                messages::tagged(messages::WORK_ORDER_COMPLETE, &completion)?,
                DEFAULT_PRIORITY,
            )
            .await?;
        Ok(())
    }

    async fn handle_rebuild(&self, envelope: &AnnotatedMessage) -> Result<()> {
        let order: RebuildWorkOrderMessage =
            messages::decode(messages::REBUILD_WORK_ORDER, &envelope.message)?;
        debug!(
            query_id = order.query_id,
            block_id = order.block_id,
            "executing rebuild work order"
        );

        let error = self.executor.execute_rebuild(&order).await.err();
        let completion = RebuildWorkOrderCompleteMessage {
            query_id: order.query_id,
            operator_index: order.operator_index,
            worker_thread_index: self.worker_thread_index,
            error,
        };
        self.bus
            .send(
                self.client_id,
                &Address::to(envelope.sender),
                &MessageStyle::default(),
                messages::tagged(messages::REBUILD_WORK_ORDER_COMPLETE, &completion)?,
                DEFAULT_PRIORITY,
            )
            .await?;
        Ok(())
    }

    /// Emits new-block and feedback messages produced by a successful work
    /// order, addressed upstream like the completion itself.
    async fn report_side_channels(
        &self,
        order: &WorkOrderMessage,
        outcome: &WorkOrderOutcome,
        reply_to: &Address,
    ) -> Result<()> {
        for &(relation_id, block_id) in &outcome.new_blocks {
            let new_block = messages::CatalogRelationNewBlockMessage {
                query_id: order.query_id,
                relation_id,
                block_id,
            };
            self.bus
                .send(
                    self.client_id,
                    reply_to,
                    &MessageStyle::default(),
                    messages::tagged(messages::CATALOG_RELATION_NEW_BLOCK, &new_block)?,
                    DEFAULT_PRIORITY,
                )
                .await?;
        }
        if let Some(payload) = &outcome.feedback {
            let feedback = messages::WorkOrderFeedbackMessage {
                query_id: order.query_id,
                operator_index: order.operator_index,
                payload: payload.clone(),
            };
            self.bus
                .send(
                    self.client_id,
                    reply_to,
                    &MessageStyle::default(),
                    messages::tagged(messages::WORK_ORDER_FEEDBACK, &feedback)?,
                    DEFAULT_PRIORITY,
                )
                .await?;
        }
        Ok(())
    }
}
