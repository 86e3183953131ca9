use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::StreamExt;

use crate::{
    cache::{CacheRead, FetchPolicy, NormalizedCache},
    config::CoordinatorConfig,
    document::{OperationKind, OperationRequest},
    error::CoordinatorError,
    multiplexer::{Delivery, DeliveryQueue, Origin, SubscriberSlot},
    payload::RawResult,
    registry::{Epoch, Operation, OperationId, OperationKey, Registry, SubscriberId},
    result::{MergedResult, NetworkStatus, OperationResult},
    scheduler::{Scheduler, TaskHandle},
    subscription::{SubscriberOptions, Subscription, WatchOptions},
    transport::{HttpTransport, ResultSink, Transport},
};

/// Entry point: hands out [`Subscription`]s and owns every running operation.
///
/// Cheap to clone, clones share the same operations.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

pub(crate) struct CoordinatorInner {
    config: CoordinatorConfig,
    transport: Transport,
    scheduler: Scheduler,
    cache: NormalizedCache,
    registry: Mutex<Registry>,
    queue: DeliveryQueue,
}

#[derive(Default)]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    transport: Option<Transport>,
    scheduler: Option<Scheduler>,
    cache: Option<NormalizedCache>,
}

impl CoordinatorBuilder {
    #[must_use]
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Shares an existing cache instead of creating one from the configuration.
    #[must_use]
    pub fn cache(mut self, cache: NormalizedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Without an explicit transport, the `[http]` section of the configuration
    /// is used. Without an explicit scheduler, the current tokio runtime is.
    pub fn build(self) -> Result<Coordinator, CoordinatorError> {
        let transport = match (self.transport, &self.config.http) {
            (Some(transport), _) => transport,
            (None, Some(http)) => Transport::new(
                HttpTransport::from_config(http).map_err(|error| CoordinatorError::Config(error.to_string()))?,
            ),
            (None, None) => return Err(CoordinatorError::NoTransport),
        };

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Scheduler::tokio()?,
        };

        let cache = self
            .cache
            .unwrap_or_else(|| NormalizedCache::new(self.config.cache.key_fields.clone()));

        Ok(Coordinator {
            inner: Arc::new(CoordinatorInner {
                config: self.config,
                transport,
                scheduler,
                cache,
                registry: Mutex::new(Registry::default()),
                queue: DeliveryQueue::default(),
            }),
        })
    }
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Prepares a subscription. Nothing is sent before [`Subscription::subscribe`].
    pub fn watch(&self, request: OperationRequest, options: WatchOptions) -> Subscription {
        let options = SubscriberOptions::resolve(options, request.kind(), &self.inner.config);
        Subscription::new(Arc::downgrade(&self.inner), request, options)
    }

    /// Executes a request and resolves with its final result, all incremental
    /// payloads merged in. Subscriptions resolve with their first event.
    ///
    /// The result is awaited here, `ignore_results` and `skip` are not applied.
    pub async fn query(&self, request: OperationRequest) -> Result<OperationResult, CoordinatorError> {
        self.query_with(request, WatchOptions::default()).await
    }

    pub async fn query_with(
        &self,
        request: OperationRequest,
        options: WatchOptions,
    ) -> Result<OperationResult, CoordinatorError> {
        let kind = request.kind();
        let options = options.ignore_results(false).skip(false);
        let mut stream = self.watch(request, options).stream()?;

        if kind == OperationKind::Subscription {
            return stream.next_settled().await.ok_or(CoordinatorError::Shutdown);
        }

        let mut settled = None;
        while let Some(result) = stream.next().await {
            if result.is_settled() {
                settled = Some(result);
            }
        }

        settled.ok_or(CoordinatorError::Shutdown)
    }

    pub fn cache(&self) -> &NormalizedCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Number of operations currently held, including those waiting for teardown.
    pub fn active_operations(&self) -> usize {
        self.inner.lock().len()
    }

    /// Stops every transport and completes every subscriber. Later subscriptions
    /// fail with [`CoordinatorError::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

enum Acquired {
    Joined(OperationId),
    Started {
        id: OperationId,
        epoch: Epoch,
        request: OperationRequest,
    },
    FromCache(OperationId),
}

impl CoordinatorInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_subscriber_id(&self) -> SubscriberId {
        self.lock().next_subscriber_id()
    }

    /// Binds a subscriber to the operation for this request, joining a running one
    /// when deduplication allows it.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        request: &OperationRequest,
        options: &SubscriberOptions,
        slot: &Arc<SubscriberSlot>,
    ) -> Result<OperationId, CoordinatorError> {
        let key = OperationKey::new(request, options.dedup_context.as_deref());

        let acquired = {
            let mut registry = self.lock();

            if registry.is_shut_down() {
                return Err(CoordinatorError::Shutdown);
            }

            let existing = if options.deduplication { registry.find(&key) } else { None };

            if let Some((id, operation)) = existing.and_then(|id| registry.get_mut(id).map(|operation| (id, operation))) {
                operation.attach(slot.clone());
                slot.attach(id, operation.epoch);
                self.queue.push(Delivery::replay(
                    slot.clone(),
                    id,
                    operation.epoch,
                    operation.result.clone(),
                ));

                tracing::debug!(
                    operation = %id,
                    subscriber = %slot.id(),
                    subscribers = operation.subscribers.len(),
                    "joined a running operation"
                );

                Acquired::Joined(id)
            } else {
                let mut operation = Operation::new(key, options.deduplication, request.clone(), options.fetch_policy);
                let cached = self.read_cache(&operation);
                let served_from_cache = cached.is_some() && operation.fetch_policy == FetchPolicy::CacheFirst;

                if let Some(data) = cached {
                    operation.result = Arc::new(if served_from_cache {
                        MergedResult::from_cache(data)
                    } else {
                        MergedResult {
                            data: Some(data),
                            ..MergedResult::loading()
                        }
                    });
                }

                let epoch = operation.epoch;
                let result = operation.result.clone();
                operation.attach(slot.clone());

                let id = registry.insert(operation);
                slot.attach(id, epoch);
                self.queue.push(Delivery::live(slot.clone(), id, epoch, result));

                tracing::debug!(
                    operation = %id,
                    subscriber = %slot.id(),
                    kind = %request.kind(),
                    from_cache = served_from_cache,
                    "registered a new operation"
                );

                if served_from_cache {
                    Acquired::FromCache(id)
                } else {
                    Acquired::Started {
                        id,
                        epoch,
                        request: request.clone(),
                    }
                }
            }
        };

        let id = match acquired {
            Acquired::Joined(id) | Acquired::FromCache(id) => id,
            Acquired::Started { id, epoch, request } => {
                self.start_transport(id, epoch, request);
                id
            }
        };

        self.queue.drain();
        Ok(id)
    }

    fn read_cache(&self, operation: &Operation) -> Option<serde_json::Value> {
        if !self.config.cache.enabled || operation.kind() != OperationKind::Query || !operation.fetch_policy.reads_cache()
        {
            return None;
        }

        match self.cache.read(&operation.key) {
            CacheRead::Hit(data) => Some(data),
            CacheRead::Miss => None,
        }
    }

    fn start_transport(self: &Arc<Self>, id: OperationId, epoch: Epoch, request: OperationRequest) {
        tracing::debug!(operation = %id, %epoch, "starting transport");

        let sink = ResultSink::new(Arc::downgrade(self), id, epoch);
        let subscription = self.transport.send(request, sink);

        let stale = {
            let mut registry = self.lock();
            match registry.get_mut(id) {
                Some(operation) if operation.epoch == epoch => operation.transport.replace(subscription),
                _ => Some(subscription),
            }
        };

        if let Some(mut stale) = stale {
            tracing::debug!(operation = %id, %epoch, "operation moved on while its transport started, stopping it");
            stale.unsubscribe();
        }
    }

    /// Entry point of every transport result.
    pub(crate) fn deliver(&self, id: OperationId, epoch: Epoch, raw: RawResult) {
        {
            let mut registry = self.lock();

            let Some(operation) = registry.get_mut(id) else {
                tracing::trace!(operation = %id, "dropping a result of a removed operation");
                return;
            };

            if operation.epoch != epoch {
                tracing::trace!(operation = %id, %epoch, "dropping a result of a superseded epoch");
                return;
            }

            if operation.result.terminal {
                tracing::debug!(operation = %id, "dropping a result received after the operation ended");
                return;
            }

            let origin = match (&raw, operation.kind()) {
                (RawResult::Next(_), OperationKind::Subscription) => Origin::Event,
                _ => Origin::Live,
            };

            let merged = operation.merger.merge(Some(&operation.result), raw);
            if merged == *operation.result && origin == Origin::Live {
                return;
            }

            if let Some(error) = &merged.transport_error {
                tracing::debug!(operation = %id, kind = %error.kind(), "operation failed: {error}");
            }

            let write_through = self.config.cache.enabled
                && operation.fetch_policy.writes_cache()
                && merged.network_status == NetworkStatus::Ready
                && !merged.has_errors()
                && !merged.has_next
                && merged.data != operation.result.data;

            if write_through {
                if let Some(data) = &merged.data {
                    self.cache.write(&operation.key, data);
                }
            }

            let merged = Arc::new(merged);
            operation.result = merged.clone();

            for slot in &operation.subscribers {
                self.queue
                    .push(Delivery::new(slot.clone(), id, epoch, merged.clone(), origin));
            }
        }

        self.queue.drain();
    }

    pub(crate) fn is_accepting(&self, id: OperationId, epoch: Epoch) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|operation| operation.epoch == epoch && !operation.result.terminal)
    }

    /// Stops deliveries to a subscriber now and drops its reference once the
    /// teardown delay elapsed.
    pub(crate) fn release(self: &Arc<Self>, id: OperationId, subscriber: SubscriberId) -> Option<TaskHandle> {
        {
            let mut registry = self.lock();
            let operation = registry.get_mut(id)?;
            let slot = operation.detach(subscriber)?;
            slot.detach();

            tracing::debug!(
                operation = %id,
                %subscriber,
                subscribers = operation.subscribers.len(),
                "released a subscriber"
            );
        }

        let inner = Arc::downgrade(self);
        let handle = self.scheduler.schedule(
            self.config.teardown_delay,
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.finish_release(id, subscriber);
                }
            }),
        );

        Some(handle)
    }

    fn finish_release(&self, id: OperationId, subscriber: SubscriberId) {
        let removed = {
            let mut registry = self.lock();
            let Some(operation) = registry.get_mut(id) else {
                return;
            };

            match operation.finish_release(subscriber) {
                Some(true) => registry.remove(id),
                _ => None,
            }
        };

        if let Some(mut operation) = removed {
            tracing::debug!(operation = %id, key = %operation.key, "tearing down an unreferenced operation");

            if let Some(mut transport) = operation.transport.take() {
                transport.unsubscribe();
            }
        }
    }

    /// Takes back a released subscriber whose teardown delay has not elapsed.
    pub(crate) fn reclaim(&self, id: OperationId, slot: &Arc<SubscriberSlot>) -> bool {
        {
            let mut registry = self.lock();
            let Some(operation) = registry.get_mut(id) else {
                return false;
            };

            if !operation.reclaim(slot.clone()) {
                return false;
            }

            slot.reattach(id);
            self.queue.push(Delivery::replay(
                slot.clone(),
                id,
                operation.epoch,
                operation.result.clone(),
            ));

            tracing::debug!(operation = %id, subscriber = %slot.id(), "reclaimed a released subscriber");
        }

        self.queue.drain();
        true
    }

    /// Moves an operation to a new epoch: the epoch is bumped first, then the old
    /// transport is stopped, then a new one is started. Every attached subscriber
    /// follows.
    pub(crate) fn restart(self: &Arc<Self>, id: OperationId) -> Result<(), CoordinatorError> {
        let (previous, request, epoch) = {
            let mut registry = self.lock();

            if registry.is_shut_down() {
                return Err(CoordinatorError::Shutdown);
            }

            let Some(operation) = registry.get_mut(id) else {
                return Err(CoordinatorError::RestartIdle);
            };

            operation.epoch = operation.epoch.next();
            let previous = operation.transport.take();

            operation.result = Arc::new(match operation.kind() {
                OperationKind::Subscription => MergedResult::loading(),
                OperationKind::Query | OperationKind::Mutation => {
                    MergedResult::refetching(operation.result.data.clone())
                }
            });

            for slot in &operation.subscribers {
                slot.restart(id, operation.epoch);
                self.queue.push(Delivery::live(
                    slot.clone(),
                    id,
                    operation.epoch,
                    operation.result.clone(),
                ));
            }

            tracing::debug!(
                operation = %id,
                epoch = %operation.epoch,
                subscribers = operation.subscribers.len(),
                "restarting operation"
            );

            (previous, operation.request.clone(), operation.epoch)
        };

        if let Some(mut previous) = previous {
            previous.unsubscribe();
        }

        self.start_transport(id, epoch, request);
        self.queue.drain();

        Ok(())
    }

    /// The skipped subscriber observes the idle result.
    pub(crate) fn notify_idle(&self, slot: &Arc<SubscriberSlot>) {
        self.queue.push(Delivery::Idle { slot: slot.clone() });
        self.queue.drain();
    }

    fn shutdown(&self) {
        let operations = self.lock().shut_down();
        let mut transports = Vec::new();

        tracing::debug!(operations = operations.len(), "shutting down");

        for (_, mut operation) in operations {
            for slot in operation.subscribers.drain(..) {
                self.queue.push(Delivery::Closed { slot });
            }
            transports.extend(operation.transport.take());
        }

        for mut transport in transports {
            transport.unsubscribe();
        }

        self.queue.drain();
    }
}
