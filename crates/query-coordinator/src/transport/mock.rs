use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::Value;

use super::{ResultSink, TransportInner, TransportSubscription};
use crate::{
    document::OperationRequest,
    error::TransportError,
    payload::{IncrementalChunk, Payload, RawResult},
    registry::Epoch,
    scheduler::Scheduler,
};

/// A transport for tests. Every `send` opens a [`MockConnection`] the test emits
/// through by hand, unless a [`MockedResponse`] matching the request was
/// registered beforehand.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    stops: Arc<AtomicUsize>,
}

#[derive(Default)]
struct MockState {
    connections: Vec<MockConnection>,
    responses: Vec<MockedResponse>,
    scheduler: Option<Scheduler>,
}

/// Canned results for the next request with the same document and variables.
#[derive(Debug, Clone)]
pub struct MockedResponse {
    request: OperationRequest,
    results: Vec<RawResult>,
    delay: Duration,
}

impl MockedResponse {
    pub fn new(request: OperationRequest) -> Self {
        MockedResponse {
            request,
            results: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn result(mut self, result: RawResult) -> Self {
        self.results.push(result);
        self
    }

    #[must_use]
    pub fn data(self, data: Value) -> Self {
        self.result(RawResult::data(data))
    }

    /// Emission is deferred through the transport's scheduler by this much.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn matches(&self, request: &OperationRequest) -> bool {
        self.request.document == request.document && self.request.variables == request.variables
    }
}

/// One call to `send`.
#[derive(Clone)]
pub struct MockConnection {
    request: OperationRequest,
    sink: ResultSink,
    stopped: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    pub fn epoch(&self) -> Epoch {
        self.sink.epoch()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Emits even when the connection was stopped, the way a real socket may
    /// still deliver what was already in flight.
    pub fn send(&self, result: RawResult) {
        self.sink.send(result);
    }

    pub fn next(&self, payload: impl Into<Payload>) {
        self.sink.next(payload);
    }

    pub fn data(&self, data: Value) {
        self.sink.data(data);
    }

    pub fn initial(&self, data: Value, has_next: bool) {
        self.send(RawResult::initial(data, has_next));
    }

    pub fn incremental(&self, chunks: Vec<IncrementalChunk>, has_next: bool) {
        self.send(RawResult::incremental(chunks, has_next));
    }

    pub fn error(&self, error: TransportError) {
        self.sink.error(error);
    }

    pub fn complete(&self) {
        self.sink.complete();
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delayed mocked responses are emitted through this scheduler.
    #[must_use]
    pub fn with_scheduler(self, scheduler: Scheduler) -> Self {
        self.lock().scheduler = Some(scheduler);
        self
    }

    pub fn mock(&self, response: MockedResponse) {
        self.lock().responses.push(response);
    }

    /// Number of times the transport was started.
    pub fn starts(&self) -> usize {
        self.lock().connections.len()
    }

    /// Number of times a started transport was unsubscribed.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn connection(&self, index: usize) -> Option<MockConnection> {
        self.lock().connections.get(index).cloned()
    }

    pub fn last_connection(&self) -> Option<MockConnection> {
        self.lock().connections.last().cloned()
    }

    pub fn connections(&self) -> Vec<MockConnection> {
        self.lock().connections.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransportInner for MockTransport {
    fn send(&self, request: OperationRequest, sink: ResultSink) -> TransportSubscription {
        let stopped = Arc::new(AtomicBool::new(false));

        let (response, scheduler) = {
            let mut state = self.lock();
            state.connections.push(MockConnection {
                request: request.clone(),
                sink: sink.clone(),
                stopped: stopped.clone(),
            });

            let position = state.responses.iter().position(|response| response.matches(&request));
            (
                position.map(|position| state.responses.remove(position)),
                state.scheduler.clone(),
            )
        };

        tracing::debug!(operation = %sink.operation(), epoch = %sink.epoch(), "mock transport started");

        if let Some(MockedResponse { results, delay, .. }) = response {
            let emit = {
                let stopped = stopped.clone();
                move || {
                    for result in results {
                        if stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        sink.send(result);
                    }
                }
            };

            match scheduler {
                // Stopping does not cancel, the stopped flag is checked at emission.
                Some(scheduler) if !delay.is_zero() => {
                    let _handle = scheduler.schedule(delay, Box::new(emit));
                }
                _ => emit(),
            }
        }

        let stops = self.stops.clone();
        TransportSubscription::new(move || {
            stopped.store(true, Ordering::SeqCst);
            stops.fetch_add(1, Ordering::SeqCst);
        })
    }
}
