//! # Shiftboss
//!
//! The per-node dispatch loop. A Shiftboss owns the node's worker roster,
//! registers with an upstream Foreman, materializes per-query contexts, and
//! places incoming work orders on workers through the configured selection
//! policy. Total in-flight work is bounded by
//! `max_messages_per_worker * num_workers`; orders arriving past that bound
//! are parked in a FIFO backlog and drained as completions free capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::bus::{Address, AnnotatedMessage, ClientId, MessageBus, MessageStyle, DEFAULT_PRIORITY};
use crate::config::{DispatchConfig, SelectionStrategy};
use crate::error::{DispatchError, Result};

use super::messages::{
    self, InitiateRebuildMessage, InitiateRebuildResponseMessage, PoisonMessage,
    QueryInitiateMessage, QueryInitiateResponseMessage, RebuildWorkOrderCompleteMessage,
    RebuildWorkOrderMessage, SaveQueryResultMessage, SaveQueryResultResponseMessage,
    ShiftbossRegistrationMessage, ShiftbossRegistrationResponseMessage, QueryTeardownMessage,
    WorkOrderCompleteMessage, WorkOrderMessage,
};
use super::query_context::{CatalogDatabaseCache, QueryContext, StorageManager};
use super::selection::{
    LoadBalancingPolicy, RandomPolicy, RoundRobinPolicy, WorkerSelectionPolicy,
};
use super::worker::{Worker, WorkOrderExecutor};
use super::worker_directory::WorkerDirectory;

/// A work order parked while every worker sits at capacity.
enum PendingDispatch {
    Work(WorkOrderMessage),
    Rebuild(RebuildWorkOrderMessage),
}

pub struct Shiftboss {
    bus: Arc<dyn MessageBus>,
    client_id: ClientId,
    max_messages_per_worker: usize,
    directory: WorkerDirectory,
    policy: Box<dyn WorkerSelectionPolicy>,
    storage: Arc<dyn StorageManager>,
    catalog_cache: CatalogDatabaseCache,
    query_contexts: HashMap<u64, QueryContext>,
    backlog: VecDeque<PendingDispatch>,
    worker_handles: Vec<tokio::task::JoinHandle<Result<()>>>,
    foreman: Option<ClientId>,
    shiftboss_index: Option<usize>,
}

impl Shiftboss {
    /// Connects the Shiftboss client, spawns the node's workers, and builds
    /// the selection policy over the resulting roster.
    pub async fn connect(
        bus: Arc<dyn MessageBus>,
        config: &DispatchConfig,
        executor: Arc<dyn WorkOrderExecutor>,
        storage: Arc<dyn StorageManager>,
    ) -> Result<Self> {
        if config.num_workers == 0 {
            return Err(DispatchError::Configuration {
                message: "num_workers must be at least 1".into(),
            });
        }

        let client_id = bus.connect().await?;
        for message_type in [
            messages::SHIFTBOSS_REGISTRATION,
            messages::QUERY_INITIATE_RESPONSE,
            messages::INITIATE_REBUILD_RESPONSE,
            messages::SAVE_QUERY_RESULT_RESPONSE,
            messages::WORK_ORDER,
            messages::REBUILD_WORK_ORDER,
            messages::WORK_ORDER_COMPLETE,
            messages::REBUILD_WORK_ORDER_COMPLETE,
            messages::WORK_ORDER_FEEDBACK,
            messages::CATALOG_RELATION_NEW_BLOCK,
            messages::DATA_PIPELINE,
            messages::POISON,
        ] {
            bus.register_client_as_sender(client_id, message_type)
                .await?;
        }
        for message_type in [
            messages::SHIFTBOSS_REGISTRATION_RESPONSE,
            messages::QUERY_INITIATE,
            messages::INITIATE_REBUILD,
            messages::SAVE_QUERY_RESULT,
            messages::WORK_ORDER,
            messages::WORK_ORDER_COMPLETE,
            messages::REBUILD_WORK_ORDER_COMPLETE,
            messages::WORK_ORDER_FEEDBACK,
            messages::CATALOG_RELATION_NEW_BLOCK,
            messages::DATA_PIPELINE,
            messages::QUERY_TEARDOWN,
            messages::POISON,
        ] {
            bus.register_client_as_receiver(client_id, message_type)
                .await?;
        }

        let mut directory = WorkerDirectory::new();
        let mut worker_handles = Vec::with_capacity(config.num_workers);
        for worker_index in 0..config.num_workers {
            let worker =
                Worker::connect(Arc::clone(&bus), worker_index, Arc::clone(&executor)).await?;
            let numa_node = config
                .worker_numa_nodes
                .get(worker_index)
                .copied()
                .unwrap_or(-1);
            directory.add_worker(worker.client_id(), numa_node);
            worker_handles.push(worker.spawn());
        }

        let policy: Box<dyn WorkerSelectionPolicy> = match config.selection_strategy {
            SelectionStrategy::RoundRobin => Box::new(RoundRobinPolicy::new(&directory, 0)?),
            SelectionStrategy::LoadBalancing => Box::new(LoadBalancingPolicy::new(&directory)?),
            SelectionStrategy::Random => Box::new(RandomPolicy::new(&directory)?),
        };

        Ok(Self {
            bus,
            client_id,
            max_messages_per_worker: config.max_messages_per_worker,
            directory,
            policy,
            storage,
            catalog_cache: CatalogDatabaseCache::new(),
            query_contexts: HashMap::new(),
            backlog: VecDeque::new(),
            worker_handles,
            foreman: None,
            shiftboss_index: None,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Total in-flight work orders this node accepts.
    pub fn work_order_capacity(&self) -> usize {
        self.max_messages_per_worker * self.directory.num_workers()
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Registers with the Foreman, then dispatches until poisoned.
    #[instrument(skip(self), fields(client = self.client_id))]
    pub async fn run(mut self) -> Result<()> {
        self.register_with_foreman().await?;
        info!(
            shiftboss_index = self.shiftboss_index,
            num_workers = self.directory.num_workers(),
            capacity = self.work_order_capacity(),
            "shiftboss online"
        );

        loop {
            let envelope = self.bus.receive(self.client_id, 0, true).await?;
            match envelope.message.message_type {
                messages::POISON => {
                    self.shut_down_workers().await?;
                    break;
                }
                messages::QUERY_INITIATE => self.handle_query_initiate(&envelope).await?,
                messages::WORK_ORDER => {
                    let order: WorkOrderMessage =
                        messages::decode(messages::WORK_ORDER, &envelope.message)?;
                    self.admit(PendingDispatch::Work(order)).await?;
                }
                messages::INITIATE_REBUILD => self.handle_initiate_rebuild(&envelope).await?,
                messages::SAVE_QUERY_RESULT => self.handle_save_query_result(&envelope).await?,
                messages::WORK_ORDER_COMPLETE => {
                    let completion: WorkOrderCompleteMessage =
                        messages::decode(messages::WORK_ORDER_COMPLETE, &envelope.message)?;
                    self.directory.decrement_queued(completion.worker_thread_index);
                    self.relay_to_foreman(&envelope).await?;
                    self.drain_backlog().await?;
                }
                messages::REBUILD_WORK_ORDER_COMPLETE => {
                    let completion: RebuildWorkOrderCompleteMessage =
                        messages::decode(messages::REBUILD_WORK_ORDER_COMPLETE, &envelope.message)?;
                    self.directory.decrement_queued(completion.worker_thread_index);
                    self.relay_to_foreman(&envelope).await?;
                    self.drain_backlog().await?;
                }
                messages::WORK_ORDER_FEEDBACK
                | messages::CATALOG_RELATION_NEW_BLOCK
                | messages::DATA_PIPELINE => {
                    self.relay_to_foreman(&envelope).await?;
                }
                messages::QUERY_TEARDOWN => {
                    let teardown: QueryTeardownMessage =
                        messages::decode(messages::QUERY_TEARDOWN, &envelope.message)?;
                    self.query_contexts.remove(&teardown.query_id);
                    debug!(query_id = teardown.query_id, "query context released");
                }
                other => {
                    warn!(message_type = other, "shiftboss received unroutable message");
                }
            }
        }

        for handle in self.worker_handles.drain(..) {
            handle
                .await
                .map_err(|join_error| DispatchError::Configuration {
                    message: format!("worker task panicked: {join_error}"),
                })??;
        }
        self.bus.disconnect(self.client_id).await?;
        info!("shiftboss shut down");
        Ok(())
    }

    /// Broadcasts the registration announcement and blocks until the Foreman
    /// answers with this node's index.
    async fn register_with_foreman(&mut self) -> Result<()> {
        let registration = ShiftbossRegistrationMessage {
            work_order_capacity: self.work_order_capacity(),
        };
        self.bus
            .send(
                self.client_id,
                &Address::all(),
                &MessageStyle::broadcast(),
                messages::tagged(messages::SHIFTBOSS_REGISTRATION, &registration)?,
                DEFAULT_PRIORITY,
            )
            .await?;

        let envelope = self.bus.receive(self.client_id, 0, true).await?;
        let response: ShiftbossRegistrationResponseMessage = messages::decode(
            messages::SHIFTBOSS_REGISTRATION_RESPONSE,
            &envelope.message,
        )?;
        self.foreman = Some(envelope.sender);
        self.shiftboss_index = Some(response.shiftboss_index);
        Ok(())
    }

    fn foreman(&self) -> Result<ClientId> {
        self.foreman.ok_or_else(|| DispatchError::Configuration {
            message: "shiftboss is not registered with a foreman".into(),
        })
    }

    async fn handle_query_initiate(&mut self, envelope: &AnnotatedMessage) -> Result<()> {
        let initiate: QueryInitiateMessage =
            messages::decode(messages::QUERY_INITIATE, &envelope.message)?;
        self.catalog_cache.update(&initiate.catalog_database_cache)?;
        let context = QueryContext::materialize(initiate.query_id, &initiate.query_context)?;
        self.query_contexts.insert(initiate.query_id, context);
        debug!(query_id = initiate.query_id, "query context materialized");

        let ack = QueryInitiateResponseMessage {
            query_id: initiate.query_id,
        };
        self.bus
            .send(
                self.client_id,
                &Address::to(envelope.sender),
                &MessageStyle::default(),
                messages::tagged(messages::QUERY_INITIATE_RESPONSE, &ack)?,
                DEFAULT_PRIORITY,
            )
            .await?;
        Ok(())
    }

    /// Synthesizes one rebuild work order per partially filled block of the
    /// named insert destination and admits them for dispatch.
    async fn handle_initiate_rebuild(&mut self, envelope: &AnnotatedMessage) -> Result<()> {
        let request: InitiateRebuildMessage =
            messages::decode(messages::INITIATE_REBUILD, &envelope.message)?;
        let context = self
            .query_contexts
            .get_mut(&request.query_id)
            .ok_or(DispatchError::UnknownQuery {
                query_id: request.query_id,
            })?;
        let (relation_id, blocks) =
            context.take_partially_filled_blocks(request.insert_destination_index)?;

        let num_rebuild_work_orders = blocks.len();
        for block_id in blocks {
            let rebuild = RebuildWorkOrderMessage {
                query_id: request.query_id,
                operator_index: request.operator_index,
                relation_id,
                block_id,
                correlation_id: uuid::Uuid::new_v4(),
            };
            self.admit(PendingDispatch::Rebuild(rebuild)).await?;
        }

        let response = InitiateRebuildResponseMessage {
            query_id: request.query_id,
            operator_index: request.operator_index,
            num_rebuild_work_orders,
            shiftboss_index: self.shiftboss_index.unwrap_or(0),
        };
        self.bus
            .send(
                self.client_id,
                &Address::to(envelope.sender),
                &MessageStyle::default(),
                messages::tagged(messages::INITIATE_REBUILD_RESPONSE, &response)?,
                DEFAULT_PRIORITY,
            )
            .await?;
        Ok(())
    }

    async fn handle_save_query_result(&mut self, envelope: &AnnotatedMessage) -> Result<()> {
        let request: SaveQueryResultMessage =
            messages::decode(messages::SAVE_QUERY_RESULT, &envelope.message)?;
        for &block_id in &request.blocks {
            self.storage.persist_block(block_id)?;
        }
        let response = SaveQueryResultResponseMessage {
            relation_id: request.relation_id,
            cli_id: request.cli_id,
        };
        self.bus
            .send(
                self.client_id,
                &Address::to(envelope.sender),
                &MessageStyle::default(),
                messages::tagged(messages::SAVE_QUERY_RESULT_RESPONSE, &response)?,
                DEFAULT_PRIORITY,
            )
            .await?;
        Ok(())
    }

    /// Dispatches now if capacity allows, otherwise parks in the backlog.
    async fn admit(&mut self, pending: PendingDispatch) -> Result<()> {
        if self.directory.total_queued() >= self.work_order_capacity() {
            self.backlog.push_back(pending);
            debug!(backlog_depth = self.backlog.len(), "work order parked at capacity");
            return Ok(());
        }
        self.dispatch(pending).await
    }

    async fn dispatch(&mut self, pending: PendingDispatch) -> Result<()> {
        let worker_index = self.policy.next_worker_index(&self.directory);
        let worker_client =
            self.directory
                .client_id(worker_index)
                .ok_or_else(|| DispatchError::Configuration {
                    message: format!("selection policy chose unknown worker {worker_index}"),
                })?;

        let message = match &pending {
            PendingDispatch::Work(order) => messages::tagged(messages::WORK_ORDER, order)?,
            PendingDispatch::Rebuild(order) => {
                messages::tagged(messages::REBUILD_WORK_ORDER, order)?
            }
        };
        self.bus
            .send(
                self.client_id,
                &Address::to(worker_client),
                &MessageStyle::default(),
                message,
                DEFAULT_PRIORITY,
            )
            .await?;
        self.directory.increment_queued(worker_index);
        let query_id = match &pending {
            PendingDispatch::Work(order) => order.query_id,
            PendingDispatch::Rebuild(order) => order.query_id,
        };
        crate::logging::log_dispatch_operation(
            "place_work_order",
            Some(query_id),
            Some(worker_index),
            "dispatched",
            None,
        );
        Ok(())
    }

    /// Moves parked work onto workers while capacity remains.
    async fn drain_backlog(&mut self) -> Result<()> {
        while self.directory.total_queued() < self.work_order_capacity() {
            match self.backlog.pop_front() {
                Some(pending) => self.dispatch(pending).await?,
                None => break,
            }
        }
        Ok(())
    }

    /// Relays a worker-originated message to the Foreman with its payload
    /// untouched.
    async fn relay_to_foreman(&self, envelope: &AnnotatedMessage) -> Result<()> {
        let foreman = self.foreman()?;
        self.bus
            .send(
                self.client_id,
                &Address::to(foreman),
                &MessageStyle::default(),
                envelope.message.clone(),
                DEFAULT_PRIORITY,
            )
            .await?;
        Ok(())
    }

    async fn shut_down_workers(&self) -> Result<()> {
        info!("shiftboss poisoning workers");
        for index in 0..self.directory.num_workers() {
            if let Some(worker_client) = self.directory.client_id(index) {
                self.bus
                    .send(
                        self.client_id,
                        &Address::to(worker_client),
                        &MessageStyle::default(),
                        messages::tagged(messages::POISON, &PoisonMessage {})?,
                        DEFAULT_PRIORITY,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
