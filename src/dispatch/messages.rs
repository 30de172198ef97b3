//! # Dispatch Message Taxonomy
//!
//! Message-type ids and serialized payload shapes exchanged between Foreman,
//! Shiftboss, and Workers. The bus routes on the type id only; payloads are
//! opaque JSON to everything but the endpoints that produce and consume them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{MessageTypeId, TaggedMessage};
use crate::error::{DispatchError, Result};

pub const SHIFTBOSS_REGISTRATION: MessageTypeId = 0;
pub const SHIFTBOSS_REGISTRATION_RESPONSE: MessageTypeId = 1;
pub const QUERY_INITIATE: MessageTypeId = 2;
pub const QUERY_INITIATE_RESPONSE: MessageTypeId = 3;
pub const INITIATE_REBUILD: MessageTypeId = 4;
pub const INITIATE_REBUILD_RESPONSE: MessageTypeId = 5;
pub const SAVE_QUERY_RESULT: MessageTypeId = 6;
pub const SAVE_QUERY_RESULT_RESPONSE: MessageTypeId = 7;
pub const WORK_ORDER: MessageTypeId = 8;
pub const REBUILD_WORK_ORDER: MessageTypeId = 9;
pub const WORK_ORDER_COMPLETE: MessageTypeId = 10;
pub const REBUILD_WORK_ORDER_COMPLETE: MessageTypeId = 11;
pub const WORK_ORDER_FEEDBACK: MessageTypeId = 12;
pub const CATALOG_RELATION_NEW_BLOCK: MessageTypeId = 13;
pub const DATA_PIPELINE: MessageTypeId = 14;
pub const QUERY_TEARDOWN: MessageTypeId = 15;
pub const POISON: MessageTypeId = 16;
pub const ADMIT_REQUEST: MessageTypeId = 17;
pub const WORKLOAD_COMPLETION: MessageTypeId = 18;

/// Encodes a payload into a tagged bus message.
pub fn tagged<T: Serialize>(message_type: MessageTypeId, payload: &T) -> Result<TaggedMessage> {
    Ok(TaggedMessage::new(
        message_type,
        serde_json::to_vec(payload)?,
    ))
}

/// Decodes a tagged bus message, checking its type id first.
pub fn decode<T: DeserializeOwned>(
    expected_type: MessageTypeId,
    message: &TaggedMessage,
) -> Result<T> {
    if message.message_type != expected_type {
        return Err(DispatchError::UnexpectedMessageType {
            message_type: message.message_type,
        });
    }
    Ok(serde_json::from_slice(&message.payload)?)
}

/// Announces a Shiftboss to whichever Foreman is listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftbossRegistrationMessage {
    /// Total in-flight work orders this node accepts:
    /// `max_messages_per_worker * num_workers`.
    pub work_order_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftbossRegistrationResponseMessage {
    /// Index the Foreman assigned to this Shiftboss.
    pub shiftboss_index: usize,
}

/// Ships a query's serialized context plus a catalog-cache delta to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInitiateMessage {
    pub query_id: u64,
    pub catalog_database_cache: serde_json::Value,
    pub query_context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInitiateResponseMessage {
    pub query_id: u64,
}

/// A unit of execution work. The `work_order` body is meaningful only to the
/// execution engine behind the worker's executor seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderMessage {
    pub query_id: u64,
    pub operator_index: usize,
    pub work_order: serde_json::Value,
    /// Correlation id for tracing a work order across nodes.
    pub correlation_id: Uuid,
}

impl WorkOrderMessage {
    pub fn new(query_id: u64, operator_index: usize, work_order: serde_json::Value) -> Self {
        Self {
            query_id,
            operator_index,
            work_order,
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// A rebuild unit synthesized by a Shiftboss from a query's partially filled
/// insert-destination blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildWorkOrderMessage {
    pub query_id: u64,
    pub operator_index: usize,
    pub relation_id: u64,
    pub block_id: u64,
    pub correlation_id: Uuid,
}

/// Execution failure carried as data inside a completion message. Worker
/// tasks never die over a bad work order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderError {
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderCompleteMessage {
    pub query_id: u64,
    pub operator_index: usize,
    /// Logical index of the worker that executed the order, used by the
    /// Shiftboss to decrement the right queued-count.
    pub worker_thread_index: usize,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkOrderError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildWorkOrderCompleteMessage {
    pub query_id: u64,
    pub operator_index: usize,
    pub worker_thread_index: usize,
    pub error: Option<WorkOrderError>,
}

/// Mid-execution feedback from a running work order to its operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderFeedbackMessage {
    pub query_id: u64,
    pub operator_index: usize,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRelationNewBlockMessage {
    pub query_id: u64,
    pub relation_id: u64,
    pub block_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPipelineMessage {
    pub query_id: u64,
    pub operator_index: usize,
    pub relation_id: u64,
    pub block_id: u64,
}

/// Asks a Shiftboss to synthesize rebuild work orders for an insert
/// destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateRebuildMessage {
    pub query_id: u64,
    pub operator_index: usize,
    pub insert_destination_index: u32,
    pub relation_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateRebuildResponseMessage {
    pub query_id: u64,
    pub operator_index: usize,
    pub num_rebuild_work_orders: usize,
    pub shiftboss_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveQueryResultMessage {
    pub query_id: u64,
    pub relation_id: u64,
    pub blocks: Vec<u64>,
    /// Client that should be told once the result is saved.
    pub cli_id: crate::bus::ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveQueryResultResponseMessage {
    pub relation_id: u64,
    pub cli_id: crate::bus::ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTeardownMessage {
    pub query_id: u64,
}

/// Shutdown pill. No payload; observing it is the terminal transition for
/// Workers and Shiftbosses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonMessage {}

/// One query in a workload admitted to a Foreman.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query_id: u64,
    pub catalog_database_cache: serde_json::Value,
    pub query_context: serde_json::Value,
    pub work_orders: Vec<PlannedWorkOrder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedWorkOrder {
    pub operator_index: usize,
    pub work_order: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitRequestMessage {
    pub queries: Vec<QueryPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadCompletionMessage {
    pub completed_query_ids: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_round_trip() {
        let original = WorkOrderMessage::new(7, 2, serde_json::json!({"scan": "lineitem"}));
        let tagged_message = tagged(WORK_ORDER, &original).unwrap();
        assert_eq!(tagged_message.message_type, WORK_ORDER);

        let decoded: WorkOrderMessage = decode(WORK_ORDER, &tagged_message).unwrap();
        assert_eq!(decoded.query_id, 7);
        assert_eq!(decoded.operator_index, 2);
        assert_eq!(decoded.correlation_id, original.correlation_id);
    }

    #[test]
    fn test_decode_rejects_wrong_type() {
        let tagged_message = tagged(POISON, &PoisonMessage {}).unwrap();
        let result: Result<WorkOrderMessage> = decode(WORK_ORDER, &tagged_message);
        assert!(matches!(
            result,
            Err(DispatchError::UnexpectedMessageType { message_type }) if message_type == POISON
        ));
    }

    #[test]
    fn test_completion_error_is_data() {
        let completion = WorkOrderCompleteMessage {
            query_id: 1,
            operator_index: 0,
            worker_thread_index: 2,
            result: None,
            error: Some(WorkOrderError {
                message: "division by zero in projection".into(),
                retryable: false,
            }),
        };
        let tagged_message = tagged(WORK_ORDER_COMPLETE, &completion).unwrap();
        let decoded: WorkOrderCompleteMessage =
            decode(WORK_ORDER_COMPLETE, &tagged_message).unwrap();
        assert_eq!(decoded.error.unwrap().message, "division by zero in projection");
    }
}
