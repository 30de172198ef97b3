//! # Foreman
//!
//! Upstream coordinator driving the dispatch lifecycle. This is a
//! single-loop driver, not a cost-based scheduler: it answers Shiftboss
//! registrations, turns admitted workloads into `QueryInitiate` plus a
//! stream of work orders, counts completions, tears queries down, and
//! reports workload completion back to whoever admitted it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::bus::{Address, AnnotatedMessage, ClientId, MessageBus, MessageStyle, DEFAULT_PRIORITY};
use crate::error::{DispatchError, Result};

use super::messages::{
    self, AdmitRequestMessage, PlannedWorkOrder, PoisonMessage, QueryInitiateMessage,
    QueryInitiateResponseMessage, QueryTeardownMessage, ShiftbossRegistrationMessage,
    ShiftbossRegistrationResponseMessage, WorkOrderCompleteMessage, WorkOrderMessage,
    WorkloadCompletionMessage,
};

struct ShiftbossEntry {
    client_id: ClientId,
    work_order_capacity: usize,
}

struct QueryState {
    workload_index: usize,
    shiftboss: ClientId,
    /// Planned orders held back until the Shiftboss acks `QueryInitiate`.
    pending_work_orders: Vec<PlannedWorkOrder>,
    remaining_completions: usize,
}

struct WorkloadState {
    admitter: ClientId,
    outstanding_queries: usize,
    completed_query_ids: Vec<u64>,
}

pub struct Foreman {
    bus: Arc<dyn MessageBus>,
    client_id: ClientId,
    shiftbosses: Vec<ShiftbossEntry>,
    next_shiftboss: usize,
    queries: HashMap<u64, QueryState>,
    workloads: Vec<WorkloadState>,
    /// Workloads admitted before any Shiftboss registered, replayed on the
    /// first registration.
    parked_admits: Vec<(ClientId, AdmitRequestMessage)>,
}

impl Foreman {
    pub async fn connect(bus: Arc<dyn MessageBus>) -> Result<Self> {
        let client_id = bus.connect().await?;
        for message_type in [
            messages::SHIFTBOSS_REGISTRATION_RESPONSE,
            messages::QUERY_INITIATE,
            messages::WORK_ORDER,
            messages::INITIATE_REBUILD,
            messages::SAVE_QUERY_RESULT,
            messages::QUERY_TEARDOWN,
            messages::WORKLOAD_COMPLETION,
            messages::POISON,
        ] {
            bus.register_client_as_sender(client_id, message_type)
                .await?;
        }
        for message_type in [
            messages::SHIFTBOSS_REGISTRATION,
            messages::QUERY_INITIATE_RESPONSE,
            messages::INITIATE_REBUILD_RESPONSE,
            messages::SAVE_QUERY_RESULT_RESPONSE,
            messages::WORK_ORDER_COMPLETE,
            messages::REBUILD_WORK_ORDER_COMPLETE,
            messages::WORK_ORDER_FEEDBACK,
            messages::CATALOG_RELATION_NEW_BLOCK,
            messages::DATA_PIPELINE,
            messages::ADMIT_REQUEST,
            messages::POISON,
        ] {
            bus.register_client_as_receiver(client_id, message_type)
                .await?;
        }
        Ok(Self {
            bus,
            client_id,
            shiftbosses: Vec::new(),
            next_shiftboss: 0,
            queries: HashMap::new(),
            workloads: Vec::new(),
            parked_admits: Vec::new(),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Runs the coordinator loop until poisoned. Poison is propagated to
    /// every registered Shiftboss before the loop exits.
    #[instrument(skip(self), fields(client = self.client_id))]
    pub async fn run(mut self) -> Result<()> {
        info!("foreman online");
        loop {
            let envelope = self.bus.receive(self.client_id, 0, true).await?;
            match envelope.message.message_type {
                messages::POISON => {
                    self.poison_shiftbosses().await?;
                    break;
                }
                messages::SHIFTBOSS_REGISTRATION => self.handle_registration(&envelope).await?,
                messages::ADMIT_REQUEST => self.handle_admit_request(&envelope).await?,
                messages::QUERY_INITIATE_RESPONSE => {
                    self.handle_query_initiate_response(&envelope).await?
                }
                messages::WORK_ORDER_COMPLETE => self.handle_completion(&envelope).await?,
                messages::REBUILD_WORK_ORDER_COMPLETE
                | messages::INITIATE_REBUILD_RESPONSE
                | messages::SAVE_QUERY_RESULT_RESPONSE
                | messages::WORK_ORDER_FEEDBACK
                | messages::CATALOG_RELATION_NEW_BLOCK
                | messages::DATA_PIPELINE => {
                    debug!(
                        message_type = envelope.message.message_type,
                        "foreman observed relay message"
                    );
                }
                other => {
                    warn!(message_type = other, "foreman received unroutable message");
                }
            }
        }
        self.bus.disconnect(self.client_id).await?;
        info!("foreman shut down");
        Ok(())
    }

    async fn handle_registration(&mut self, envelope: &AnnotatedMessage) -> Result<()> {
        let registration: ShiftbossRegistrationMessage =
            messages::decode(messages::SHIFTBOSS_REGISTRATION, &envelope.message)?;
        let shiftboss_index = self.shiftbosses.len();
        self.shiftbosses.push(ShiftbossEntry {
            client_id: envelope.sender,
            work_order_capacity: registration.work_order_capacity,
        });
        info!(
            shiftboss_index,
            shiftboss = envelope.sender,
            capacity = registration.work_order_capacity,
            "shiftboss registered"
        );

        let response = ShiftbossRegistrationResponseMessage { shiftboss_index };
        self.bus
            .send(
                self.client_id,
                &Address::to(envelope.sender),
                &MessageStyle::default(),
                messages::tagged(messages::SHIFTBOSS_REGISTRATION_RESPONSE, &response)?,
                DEFAULT_PRIORITY,
            )
            .await?;

        for (admitter, request) in std::mem::take(&mut self.parked_admits) {
            self.admit_workload(admitter, request).await?;
        }
        Ok(())
    }

    /// Admits a workload: each query is assigned a Shiftboss round-robin and
    /// initiated there. Work orders stay held until the initiate ack.
    async fn handle_admit_request(&mut self, envelope: &AnnotatedMessage) -> Result<()> {
        let request: AdmitRequestMessage =
            messages::decode(messages::ADMIT_REQUEST, &envelope.message)?;
        if self.shiftbosses.is_empty() {
            debug!("workload admitted before any shiftboss registered, parking");
            self.parked_admits.push((envelope.sender, request));
            return Ok(());
        }
        self.admit_workload(envelope.sender, request).await
    }

    async fn admit_workload(
        &mut self,
        admitter: ClientId,
        request: AdmitRequestMessage,
    ) -> Result<()> {
        let workload_index = self.workloads.len();
        self.workloads.push(WorkloadState {
            admitter,
            outstanding_queries: request.queries.len(),
            completed_query_ids: Vec::new(),
        });

        for query in request.queries {
            let shiftboss = self.pick_shiftboss();
            let initiate = QueryInitiateMessage {
                query_id: query.query_id,
                catalog_database_cache: query.catalog_database_cache,
                query_context: query.query_context,
            };
            self.queries.insert(
                query.query_id,
                QueryState {
                    workload_index,
                    shiftboss,
                    remaining_completions: query.work_orders.len(),
                    pending_work_orders: query.work_orders,
                },
            );
            self.bus
                .send(
                    self.client_id,
                    &Address::to(shiftboss),
                    &MessageStyle::default(),
                    messages::tagged(messages::QUERY_INITIATE, &initiate)?,
                    DEFAULT_PRIORITY,
                )
                .await?;
        }
        Ok(())
    }

    /// Streams a query's work orders once its Shiftboss has materialized the
    /// context.
    async fn handle_query_initiate_response(&mut self, envelope: &AnnotatedMessage) -> Result<()> {
        let response: QueryInitiateResponseMessage =
            messages::decode(messages::QUERY_INITIATE_RESPONSE, &envelope.message)?;
        let state =
            self.queries
                .get_mut(&response.query_id)
                .ok_or(DispatchError::UnknownQuery {
                    query_id: response.query_id,
                })?;

        let shiftboss = state.shiftboss;
        let planned = std::mem::take(&mut state.pending_work_orders);
        if planned.is_empty() {
            // A query with no work orders completes at initiation.
            self.finish_query(response.query_id).await?;
            return Ok(());
        }
        for order in planned {
            let message =
                WorkOrderMessage::new(response.query_id, order.operator_index, order.work_order);
            self.bus
                .send(
                    self.client_id,
                    &Address::to(shiftboss),
                    &MessageStyle::default(),
                    messages::tagged(messages::WORK_ORDER, &message)?,
                    DEFAULT_PRIORITY,
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_completion(&mut self, envelope: &AnnotatedMessage) -> Result<()> {
        let completion: WorkOrderCompleteMessage =
            messages::decode(messages::WORK_ORDER_COMPLETE, &envelope.message)?;
        if let Some(error) = &completion.error {
            warn!(
                query_id = completion.query_id,
                error = %error.message,
                retryable = error.retryable,
                "work order completed with error"
            );
        }
        // A stray or duplicate completion must not take the coordinator down.
        let Some(state) = self.queries.get_mut(&completion.query_id) else {
            warn!(
                query_id = completion.query_id,
                "completion for unknown query ignored"
            );
            return Ok(());
        };
        state.remaining_completions = state.remaining_completions.saturating_sub(1);
        if state.remaining_completions == 0 {
            self.finish_query(completion.query_id).await?;
        }
        Ok(())
    }

    /// Tears the query down on its Shiftboss and, when this was the
    /// workload's last query, reports completion to the admitter.
    async fn finish_query(&mut self, query_id: u64) -> Result<()> {
        let state = self
            .queries
            .remove(&query_id)
            .ok_or(DispatchError::UnknownQuery { query_id })?;
        let teardown = QueryTeardownMessage { query_id };
        self.bus
            .send(
                self.client_id,
                &Address::to(state.shiftboss),
                &MessageStyle::default(),
                messages::tagged(messages::QUERY_TEARDOWN, &teardown)?,
                DEFAULT_PRIORITY,
            )
            .await?;
        debug!(query_id, "query complete");

        let workload = &mut self.workloads[state.workload_index];
        workload.completed_query_ids.push(query_id);
        workload.outstanding_queries -= 1;
        if workload.outstanding_queries == 0 {
            let completion = WorkloadCompletionMessage {
                completed_query_ids: workload.completed_query_ids.clone(),
            };
            self.bus
                .send(
                    self.client_id,
                    &Address::to(workload.admitter),
                    &MessageStyle::default(),
                    messages::tagged(messages::WORKLOAD_COMPLETION, &completion)?,
                    DEFAULT_PRIORITY,
                )
                .await?;
            info!(
                queries = workload.completed_query_ids.len(),
                "workload complete"
            );
        }
        Ok(())
    }

    fn pick_shiftboss(&mut self) -> ClientId {
        let chosen = &self.shiftbosses[self.next_shiftboss % self.shiftbosses.len()];
        self.next_shiftboss = (self.next_shiftboss + 1) % self.shiftbosses.len();
        // Capacity is advisory here: the Shiftboss backlogs past it.
        debug!(
            shiftboss = chosen.client_id,
            capacity = chosen.work_order_capacity,
            "query placed"
        );
        chosen.client_id
    }

    async fn poison_shiftbosses(&self) -> Result<()> {
        info!("foreman poisoning shiftbosses");
        for entry in &self.shiftbosses {
            self.bus
                .send(
                    self.client_id,
                    &Address::to(entry.client_id),
                    &MessageStyle::default(),
                    messages::tagged(messages::POISON, &PoisonMessage {})?,
                    DEFAULT_PRIORITY,
                )
                .await?;
        }
        Ok(())
    }
}
