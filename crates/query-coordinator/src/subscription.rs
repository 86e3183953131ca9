use std::sync::{Arc, Weak};

use crate::{
    cache::FetchPolicy,
    callbacks::SubscriptionCallbacks,
    config::CoordinatorConfig,
    coordinator::CoordinatorInner,
    document::{OperationKind, OperationRequest},
    error::CoordinatorError,
    multiplexer::{Observer, SubscriberSlot},
    policy::ErrorPolicy,
    registry::OperationId,
    result::OperationResult,
    scheduler::TaskHandle,
    stream::{ChannelObserver, ResultStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionState {
    /// Not subscribed yet, or unsubscribed.
    Idle,
    Active,
    Completed,
    Errored,
    Skipped,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionState::Completed | SubscriptionState::Errored)
    }
}

/// Per-subscription settings. Anything left unset falls back to the
/// coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    error_policy: Option<ErrorPolicy>,
    fetch_policy: Option<FetchPolicy>,
    deduplication: Option<bool>,
    dedup_context: Option<String>,
    ignore_results: bool,
    skip: bool,
    callbacks: SubscriptionCallbacks,
}

impl WatchOptions {
    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn deduplication(mut self, enabled: bool) -> Self {
        self.deduplication = Some(enabled);
        self
    }

    /// Operations are only shared between subscriptions with the same context,
    /// for example a tenant or a user.
    #[must_use]
    pub fn dedup_context(mut self, context: impl Into<String>) -> Self {
        self.dedup_context = Some(context.into());
        self
    }

    /// The observer is not notified of results, only of errors and completion.
    /// Callbacks still fire.
    #[must_use]
    pub fn ignore_results(mut self, ignore: bool) -> Self {
        self.ignore_results = ignore;
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn callbacks(mut self, callbacks: SubscriptionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SubscriberOptions {
    pub error_policy: ErrorPolicy,
    pub fetch_policy: FetchPolicy,
    pub deduplication: bool,
    pub dedup_context: Option<String>,
    pub ignore_results: bool,
    pub skip: bool,
    pub callbacks: SubscriptionCallbacks,
}

impl SubscriberOptions {
    pub fn resolve(options: WatchOptions, kind: OperationKind, config: &CoordinatorConfig) -> Self {
        SubscriberOptions {
            error_policy: options.error_policy.unwrap_or(config.error_policy),
            fetch_policy: options.fetch_policy.unwrap_or(config.fetch_policy),
            // Two identical mutations are two writes.
            deduplication: kind != OperationKind::Mutation && options.deduplication.unwrap_or(config.deduplication),
            dedup_context: options.dedup_context,
            ignore_results: options.ignore_results,
            skip: options.skip,
            callbacks: options.callbacks,
        }
    }
}

enum Binding {
    Unbound,
    Bound(OperationId),
    Released {
        operation: OperationId,
        teardown: Option<TaskHandle>,
    },
}

/// A handle on one subscriber of an operation.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    coordinator: Weak<CoordinatorInner>,
    request: OperationRequest,
    options: SubscriberOptions,
    observer: Option<Arc<dyn Observer>>,
    slot: Option<Arc<SubscriberSlot>>,
    binding: Binding,
}

impl Subscription {
    pub(crate) fn new(coordinator: Weak<CoordinatorInner>, request: OperationRequest, options: SubscriberOptions) -> Self {
        Subscription {
            coordinator,
            request,
            options,
            observer: None,
            slot: None,
            binding: Binding::Unbound,
        }
    }

    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    /// Starts delivering results to the observer. A skipped subscription only
    /// observes the idle result until it is unskipped.
    pub fn subscribe(&mut self, observer: impl Observer + 'static) -> Result<(), CoordinatorError> {
        if self.observer.is_some() {
            return Err(CoordinatorError::AlreadySubscribed);
        }

        let inner = self.coordinator()?;
        let observer: Arc<dyn Observer> = Arc::new(observer);
        let slot = self.new_slot(&inner, observer.clone());

        if self.options.skip {
            inner.notify_idle(&slot);
        } else {
            let operation = inner.acquire(&self.request, &self.options, &slot)?;
            self.binding = Binding::Bound(operation);
        }

        self.observer = Some(observer);
        self.slot = Some(slot);

        Ok(())
    }

    /// Skipping releases the operation and shows the idle result, unskipping
    /// binds again, joining the operation if it is still around.
    pub fn set_skip(&mut self, skip: bool) -> Result<(), CoordinatorError> {
        if self.options.skip == skip {
            return Ok(());
        }
        self.options.skip = skip;

        let Some(observer) = self.observer.clone() else {
            return Ok(());
        };

        let inner = self.coordinator()?;

        if skip {
            self.unbind();
            if let Some(slot) = &self.slot {
                inner.notify_idle(slot);
            }
        } else {
            // The observer saw the idle result in between, so the current result
            // is delivered again through a fresh slot.
            let slot = self.new_slot(&inner, observer);
            let operation = inner.acquire(&self.request, &self.options, &slot)?;
            self.slot = Some(slot);
            self.binding = Binding::Bound(operation);
        }

        Ok(())
    }

    pub fn is_skipped(&self) -> bool {
        self.options.skip
    }

    /// Re-executes the operation for every subscriber sharing it.
    pub fn restart(&self) -> Result<(), CoordinatorError> {
        if self.options.skip {
            return Err(CoordinatorError::RestartSkipped);
        }

        let Binding::Bound(operation) = self.binding else {
            return Err(CoordinatorError::RestartIdle);
        };

        self.coordinator()?.restart(operation)
    }

    /// Stops receiving results. The operation is torn down once its last
    /// subscriber is gone for longer than the teardown delay.
    pub fn unsubscribe(&mut self) {
        self.unbind();
    }

    /// Binds again after [`Subscription::unsubscribe`]. Within the teardown delay
    /// the subscriber continues where it left off.
    pub fn resubscribe(&mut self) -> Result<(), CoordinatorError> {
        let Some(slot) = self.slot.clone() else {
            return Err(CoordinatorError::NotSubscribed);
        };

        if self.options.skip {
            return Ok(());
        }

        let inner = self.coordinator()?;

        match std::mem::replace(&mut self.binding, Binding::Unbound) {
            Binding::Bound(operation) => {
                self.binding = Binding::Bound(operation);
                return Ok(());
            }
            Binding::Released { operation, teardown } => {
                if inner.reclaim(operation, &slot) {
                    if let Some(teardown) = teardown {
                        teardown.cancel();
                    }
                    self.binding = Binding::Bound(operation);
                    return Ok(());
                }
            }
            Binding::Unbound => {}
        }

        let operation = inner.acquire(&self.request, &self.options, &slot)?;
        self.binding = Binding::Bound(operation);

        Ok(())
    }

    /// The last result delivered to this subscription.
    pub fn result(&self) -> OperationResult {
        self.slot
            .as_ref()
            .and_then(|slot| slot.last_result())
            .unwrap_or_else(OperationResult::idle)
    }

    pub fn state(&self) -> SubscriptionState {
        match (&self.slot, &self.binding) {
            (None, _) => SubscriptionState::Idle,
            (Some(_), _) if self.options.skip => SubscriptionState::Skipped,
            (Some(slot), Binding::Bound(_)) => slot.lifecycle(),
            (Some(_), _) => SubscriptionState::Idle,
        }
    }

    /// Subscribes and returns the results as a stream, which ends with the
    /// first terminal result.
    pub fn stream(mut self) -> Result<ResultStream, CoordinatorError> {
        let (observer, receiver) = ChannelObserver::new();
        self.subscribe(observer)?;
        Ok(ResultStream::new(receiver, self))
    }

    fn coordinator(&self) -> Result<Arc<CoordinatorInner>, CoordinatorError> {
        self.coordinator.upgrade().ok_or(CoordinatorError::Shutdown)
    }

    fn new_slot(&self, inner: &CoordinatorInner, observer: Arc<dyn Observer>) -> Arc<SubscriberSlot> {
        Arc::new(SubscriberSlot::new(
            inner.next_subscriber_id(),
            observer,
            self.options.error_policy,
            self.options.ignore_results,
            self.options.callbacks.clone(),
        ))
    }

    fn unbind(&mut self) {
        let Binding::Bound(operation) = self.binding else {
            return;
        };

        let (Some(inner), Some(slot)) = (self.coordinator.upgrade(), &self.slot) else {
            self.binding = Binding::Unbound;
            return;
        };

        self.binding = Binding::Released {
            operation,
            teardown: inner.release(operation, slot.id()),
        };
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("request", &self.request)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::{
        document::Document,
        error::{GraphqlError, TransportError},
        payload::RawResult,
        result::NetworkStatus,
        scheduler::{ManualScheduler, Scheduler},
        testing::RecordingObserver,
        transport::{MockTransport, Transport},
        Coordinator,
    };

    fn setup() -> (Coordinator, MockTransport, ManualScheduler) {
        let transport = MockTransport::new();
        let scheduler = ManualScheduler::new();
        let coordinator = Coordinator::builder()
            .transport(Transport::new(transport.clone()))
            .scheduler(Scheduler::new(scheduler.clone()))
            .build()
            .unwrap();

        (coordinator, transport, scheduler)
    }

    fn ticks() -> OperationRequest {
        OperationRequest::new(Document::parse("subscription Ticks { tick }", None).unwrap())
    }

    #[test]
    fn options_fall_back_to_the_configuration() {
        let config = CoordinatorConfig {
            error_policy: ErrorPolicy::All,
            deduplication: false,
            ..Default::default()
        };

        let resolved = SubscriberOptions::resolve(WatchOptions::default(), OperationKind::Query, &config);
        assert_eq!(resolved.error_policy, ErrorPolicy::All);
        assert_eq!(resolved.fetch_policy, FetchPolicy::CacheFirst);
        assert!(!resolved.deduplication);

        let resolved = SubscriberOptions::resolve(
            WatchOptions::default()
                .error_policy(ErrorPolicy::Ignore)
                .deduplication(true),
            OperationKind::Query,
            &config,
        );
        assert_eq!(resolved.error_policy, ErrorPolicy::Ignore);
        assert!(resolved.deduplication);
    }

    #[test]
    fn mutations_are_never_deduplicated() {
        let resolved = SubscriberOptions::resolve(
            WatchOptions::default().deduplication(true),
            OperationKind::Mutation,
            &CoordinatorConfig::default(),
        );

        assert!(!resolved.deduplication);
    }

    #[test]
    fn states_follow_the_lifecycle() {
        let (coordinator, transport, _) = setup();

        let mut subscription = coordinator.watch(ticks(), WatchOptions::default());
        assert_eq!(subscription.state(), SubscriptionState::Idle);
        assert_eq!(subscription.result(), OperationResult::idle());

        subscription.subscribe(RecordingObserver::new()).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Active);
        assert_eq!(subscription.result(), OperationResult::loading());

        transport.connection(0).unwrap().complete();
        assert_eq!(subscription.state(), SubscriptionState::Completed);

        subscription.unsubscribe();
        assert_eq!(subscription.state(), SubscriptionState::Idle);
    }

    #[test]
    fn subscribing_twice_is_rejected() {
        let (coordinator, _, _) = setup();

        let mut subscription = coordinator.watch(ticks(), WatchOptions::default());
        subscription.subscribe(RecordingObserver::new()).unwrap();

        assert_eq!(
            subscription.subscribe(RecordingObserver::new()),
            Err(CoordinatorError::AlreadySubscribed)
        );
    }

    #[test]
    fn restart_requires_an_active_subscription() {
        let (coordinator, _, _) = setup();

        let subscription = coordinator.watch(ticks(), WatchOptions::default());
        assert_eq!(subscription.restart(), Err(CoordinatorError::RestartIdle));

        let mut skipped = coordinator.watch(ticks(), WatchOptions::default().skip(true));
        skipped.subscribe(RecordingObserver::new()).unwrap();
        assert_eq!(skipped.restart(), Err(CoordinatorError::RestartSkipped));

        let mut never = coordinator.watch(ticks(), WatchOptions::default());
        assert_eq!(never.resubscribe(), Err(CoordinatorError::NotSubscribed));
    }

    #[test]
    fn skipped_subscriptions_stay_idle_until_unskipped() {
        let (coordinator, transport, _) = setup();
        let observer = RecordingObserver::new();

        let mut subscription = coordinator.watch(ticks(), WatchOptions::default().skip(true));
        subscription.subscribe(observer.clone()).unwrap();

        assert_eq!(subscription.state(), SubscriptionState::Skipped);
        assert_eq!(transport.starts(), 0);
        assert_eq!(observer.results(), vec![OperationResult::idle()]);

        subscription.set_skip(false).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Active);
        assert_eq!(transport.starts(), 1);

        transport.connection(0).unwrap().data(json!({ "tick": 1 }));
        assert_eq!(
            observer.results(),
            vec![
                OperationResult::idle(),
                OperationResult::loading(),
                OperationResult::ready(json!({ "tick": 1 })),
            ]
        );
    }

    #[test]
    fn skipping_an_active_subscription_releases_it() {
        let (coordinator, transport, scheduler) = setup();
        let observer = RecordingObserver::new();

        let mut subscription = coordinator.watch(ticks(), WatchOptions::default());
        subscription.subscribe(observer.clone()).unwrap();
        transport.connection(0).unwrap().data(json!({ "tick": 1 }));

        subscription.set_skip(true).unwrap();
        assert_eq!(subscription.state(), SubscriptionState::Skipped);
        assert_eq!(observer.results().last(), Some(&OperationResult::idle()));

        // Within the teardown delay the running operation is joined again and
        // its current result replayed.
        subscription.set_skip(false).unwrap();
        scheduler.advance(Duration::from_secs(1));

        assert_eq!(transport.starts(), 1);
        assert_eq!(transport.stops(), 0);
        assert_eq!(
            observer.results().last(),
            Some(&OperationResult::ready(json!({ "tick": 1 })))
        );

        drop(subscription);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(transport.stops(), 1);
    }

    #[test]
    fn resubscribing_within_the_teardown_delay_keeps_the_operation() {
        let (coordinator, transport, scheduler) = setup();
        let observer = RecordingObserver::new();

        let mut subscription = coordinator.watch(ticks(), WatchOptions::default());
        subscription.subscribe(observer.clone()).unwrap();

        let connection = transport.connection(0).unwrap();
        connection.data(json!({ "tick": 1 }));

        subscription.unsubscribe();
        connection.data(json!({ "tick": 2 }));
        assert_eq!(observer.results().len(), 2);

        subscription.resubscribe().unwrap();
        assert_eq!(scheduler.pending(), 0);
        scheduler.advance(Duration::from_secs(1));

        assert_eq!(transport.stops(), 0);
        assert_eq!(
            observer.results().last(),
            Some(&OperationResult::ready(json!({ "tick": 2 })))
        );
    }

    #[test]
    fn resubscribing_after_teardown_starts_again() {
        let (coordinator, transport, scheduler) = setup();

        let mut subscription = coordinator.watch(ticks(), WatchOptions::default());
        subscription.subscribe(RecordingObserver::new()).unwrap();
        subscription.unsubscribe();
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(transport.stops(), 1);

        subscription.resubscribe().unwrap();
        assert_eq!(transport.starts(), 2);
        assert_eq!(subscription.state(), SubscriptionState::Active);
    }

    #[test]
    fn ignored_results_still_fire_callbacks() {
        let (coordinator, transport, _) = setup();
        let observer = RecordingObserver::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let callbacks = {
            let seen = seen.clone();
            SubscriptionCallbacks::new().on_data(move |result| seen.lock().unwrap().push(result.data.clone()))
        };

        let mut subscription = coordinator.watch(
            ticks(),
            WatchOptions::default().ignore_results(true).callbacks(callbacks),
        );
        subscription.subscribe(observer.clone()).unwrap();

        let connection = transport.connection(0).unwrap();
        connection.data(json!({ "tick": 1 }));
        connection.complete();

        assert!(observer.results().is_empty());
        assert_eq!(observer.completions(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!({ "tick": 1 }))]);
    }

    #[test]
    fn error_callbacks_receive_the_policy_projection() {
        let (coordinator, transport, _) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));

        let callbacks = {
            let errors = errors.clone();
            SubscriptionCallbacks::new().on_error(move |error| errors.lock().unwrap().push(error.message.clone()))
        };

        let mut subscription = coordinator.watch(ticks(), WatchOptions::default().callbacks(callbacks));
        subscription.subscribe(RecordingObserver::new()).unwrap();

        transport
            .connection(0)
            .unwrap()
            .send(RawResult::with_errors(None, vec![GraphqlError::new("tick failed")]));

        assert_eq!(subscription.state(), SubscriptionState::Errored);
        assert_eq!(*errors.lock().unwrap(), vec!["tick failed".to_string()]);
        assert_eq!(subscription.result().network_status, NetworkStatus::Error);
    }

    #[tokio::test]
    async fn streams_end_with_the_terminal_result() {
        use futures_util::StreamExt;

        let (coordinator, transport, _) = setup();

        let mut stream = coordinator.watch(ticks(), WatchOptions::default()).stream().unwrap();
        let connection = transport.connection(0).unwrap();
        connection.data(json!({ "tick": 1 }));
        connection.error(TransportError::network("connection reset"));

        assert_eq!(stream.next().await, Some(OperationResult::loading()));
        assert_eq!(stream.next().await, Some(OperationResult::ready(json!({ "tick": 1 }))));

        let failed = stream.next().await.unwrap();
        assert_eq!(failed.network_status, NetworkStatus::Error);
        assert!(failed.error.unwrap().network_error.is_some());

        assert_eq!(stream.next().await, None);
    }
}
