//! Fan-out of operation results to subscribers.
//!
//! Registry mutations queue deliveries while holding the registry lock, so the
//! queue order is the order in which results were produced. The queue is drained
//! by a single thread at a time without any lock held while user code runs;
//! a callback that triggers new deliveries only enqueues them and returns.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    callbacks::SubscriptionCallbacks,
    error::ClientError,
    policy::{self, ErrorPolicy, Outcome},
    registry::{Epoch, OperationId, SubscriberId},
    result::{MergedResult, OperationResult},
    subscription::SubscriptionState,
};

/// Receives the results of a subscription.
///
/// `on_next` is only called when the observed result differs from the previous
/// one. After `on_error` or `on_complete` nothing is delivered until a restart.
pub trait Observer: Send + Sync {
    fn on_next(&self, result: &OperationResult);

    fn on_error(&self, _error: &ClientError) {}

    fn on_complete(&self) {}
}

impl<F> Observer for F
where
    F: Fn(&OperationResult) + Send + Sync,
{
    fn on_next(&self, result: &OperationResult) {
        self(result)
    }
}

pub(crate) struct SubscriberSlot {
    id: SubscriberId,
    observer: Arc<dyn Observer>,
    error_policy: ErrorPolicy,
    ignore_results: bool,
    callbacks: SubscriptionCallbacks,
    state: Mutex<SlotState>,
}

struct SlotState {
    operation: Option<OperationId>,
    epoch: Epoch,
    lifecycle: SubscriptionState,
    last: Option<OperationResult>,
}

impl SubscriberSlot {
    pub fn new(
        id: SubscriberId,
        observer: Arc<dyn Observer>,
        error_policy: ErrorPolicy,
        ignore_results: bool,
        callbacks: SubscriptionCallbacks,
    ) -> Self {
        SubscriberSlot {
            id,
            observer,
            error_policy,
            ignore_results,
            callbacks,
            state: Mutex::new(SlotState {
                operation: None,
                epoch: Epoch::default(),
                lifecycle: SubscriptionState::Idle,
                last: None,
            }),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Starts receiving deliveries of an operation.
    pub fn attach(&self, operation: OperationId, epoch: Epoch) {
        let mut state = self.lock();
        if state.operation == Some(operation) {
            return;
        }
        state.operation = Some(operation);
        state.epoch = epoch;
        state.lifecycle = SubscriptionState::Active;
    }

    /// Re-attaches to the operation it was released from, keeping its progress.
    pub fn reattach(&self, operation: OperationId) {
        self.lock().operation = Some(operation);
    }

    pub fn detach(&self) {
        self.lock().operation = None;
    }

    /// Moves to a new epoch of the attached operation.
    pub fn restart(&self, operation: OperationId, epoch: Epoch) {
        let mut state = self.lock();
        if state.operation == Some(operation) && state.epoch < epoch {
            state.epoch = epoch;
            state.lifecycle = SubscriptionState::Active;
        }
    }

    pub fn lifecycle(&self) -> SubscriptionState {
        self.lock().lifecycle
    }

    pub fn last_result(&self) -> Option<OperationResult> {
        self.lock().last.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SubscriberSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSlot")
            .field("id", &self.id)
            .field("error_policy", &self.error_policy)
            .field("ignore_results", &self.ignore_results)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

/// Why a result is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Catching up a subscriber that joined late. Side-effect callbacks stay quiet.
    Replay,
    /// The operation result changed.
    Live,
    /// A subscription event. `on_data` fires even when the result did not change.
    Event,
}

pub(crate) enum Delivery {
    Result {
        slot: Arc<SubscriberSlot>,
        operation: OperationId,
        epoch: Epoch,
        result: Arc<MergedResult>,
        origin: Origin,
    },
    /// The subscriber was skipped, it observes the idle result.
    Idle { slot: Arc<SubscriberSlot> },
    /// The coordinator shut down.
    Closed { slot: Arc<SubscriberSlot> },
}

impl Delivery {
    pub fn live(slot: Arc<SubscriberSlot>, operation: OperationId, epoch: Epoch, result: Arc<MergedResult>) -> Self {
        Self::new(slot, operation, epoch, result, Origin::Live)
    }

    pub fn replay(slot: Arc<SubscriberSlot>, operation: OperationId, epoch: Epoch, result: Arc<MergedResult>) -> Self {
        Self::new(slot, operation, epoch, result, Origin::Replay)
    }

    pub fn new(
        slot: Arc<SubscriberSlot>,
        operation: OperationId,
        epoch: Epoch,
        result: Arc<MergedResult>,
        origin: Origin,
    ) -> Self {
        Delivery::Result {
            slot,
            operation,
            epoch,
            result,
            origin,
        }
    }
}

#[derive(Default)]
pub(crate) struct DeliveryQueue {
    pending: Mutex<VecDeque<Delivery>>,
    draining: AtomicBool,
}

impl DeliveryQueue {
    pub fn push(&self, delivery: Delivery) {
        self.lock().push_back(delivery);
    }

    /// Dispatches queued deliveries until the queue is empty. Returns immediately
    /// when another call is already draining, that call picks up the new items.
    pub fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }

            loop {
                let next = self.lock().pop_front();
                match next {
                    Some(delivery) => dispatch(delivery),
                    None => break,
                }
            }

            self.draining.store(false, Ordering::Release);

            // Something may have been queued after the last pop but before the
            // flag was cleared.
            if self.lock().is_empty() {
                return;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Notification {
    Next(OperationResult),
    Unchanged,
}

fn dispatch(delivery: Delivery) {
    match delivery {
        Delivery::Result {
            slot,
            operation,
            epoch,
            result,
            origin,
        } => dispatch_result(&slot, operation, epoch, &result, origin),
        Delivery::Idle { slot } => {
            let idle = OperationResult::idle();
            let changed = {
                let mut state = slot.lock();
                let changed = state.last.as_ref() != Some(&idle);
                state.last = Some(idle.clone());
                changed
            };

            if changed && !slot.ignore_results {
                slot.observer.on_next(&idle);
            }
        }
        Delivery::Closed { slot } => {
            let was_terminal = {
                let mut state = slot.lock();
                state.operation = None;
                let was_terminal = state.lifecycle.is_terminal();
                if !was_terminal {
                    state.lifecycle = SubscriptionState::Completed;
                }
                was_terminal
            };

            if !was_terminal {
                slot.observer.on_complete();
            }
        }
    }
}

fn dispatch_result(slot: &SubscriberSlot, operation: OperationId, epoch: Epoch, result: &MergedResult, origin: Origin) {
    let (notification, filtered) = {
        let mut state = slot.lock();

        if state.operation != Some(operation) {
            return;
        }
        if epoch < state.epoch {
            tracing::trace!(subscriber = %slot.id, %operation, %epoch, "dropping a delivery of a superseded epoch");
            return;
        }
        if epoch > state.epoch {
            state.epoch = epoch;
            state.lifecycle = SubscriptionState::Active;
        }
        if state.lifecycle.is_terminal() {
            return;
        }

        let filtered = policy::filter(slot.error_policy, result);

        let notification = if state.last.as_ref() == Some(&filtered.result) {
            Notification::Unchanged
        } else {
            state.last = Some(filtered.result.clone());
            Notification::Next(filtered.result.clone())
        };

        match &filtered.outcome {
            Outcome::Continue => {}
            Outcome::Completed => state.lifecycle = SubscriptionState::Completed,
            Outcome::Errored(_) => state.lifecycle = SubscriptionState::Errored,
        }

        (notification, filtered)
    };

    if let Notification::Next(result) = &notification {
        if !slot.ignore_results {
            slot.observer.on_next(result);
        }
    }

    if origin != Origin::Replay {
        match (&filtered.outcome, &notification) {
            (Outcome::Errored(error), _) => slot.callbacks.error(error),
            (_, Notification::Next(result)) if !result.loading => slot.callbacks.data(result),
            (_, Notification::Unchanged) if origin == Origin::Event && !filtered.result.loading => {
                slot.callbacks.data(&filtered.result)
            }
            _ => {}
        }
        if filtered.outcome == Outcome::Completed {
            slot.callbacks.complete();
        }
    }

    match filtered.outcome {
        Outcome::Continue => {}
        Outcome::Completed => slot.observer.on_complete(),
        Outcome::Errored(error) => slot.observer.on_error(&error),
    }
}
