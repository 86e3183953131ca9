//! The seam between the coordinator and the network.
//!
//! A transport receives an [`OperationRequest`] together with a [`ResultSink`]
//! and pushes raw results into the sink until it completes, fails or is
//! unsubscribed. Sinks are stamped with the operation and epoch they were created
//! for, so a transport that keeps emitting after being stopped or superseded by a
//! restart is harmless: its results are dropped on arrival.

mod http;
#[cfg(any(test, feature = "test-utils"))]
mod mock;
mod stream;

use std::{
    fmt,
    ops::Deref,
    sync::{Arc, Weak},
};

use serde_json::Value;

pub use self::{
    http::{HttpTransport, HttpTransportBuilder},
    stream::StreamTransport,
};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockConnection, MockTransport, MockedResponse};

use crate::{
    coordinator::CoordinatorInner,
    document::OperationRequest,
    error::TransportError,
    payload::{Payload, RawResult},
    registry::{Epoch, OperationId},
};

pub trait TransportInner: Send + Sync {
    /// Starts executing the request. Results may be pushed into the sink
    /// synchronously from within this call.
    fn send(&self, request: OperationRequest, sink: ResultSink) -> TransportSubscription;
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<dyn TransportInner>,
}

impl Transport {
    pub fn new(transport: impl TransportInner + 'static) -> Transport {
        Transport {
            inner: Arc::new(transport),
        }
    }
}

impl Deref for Transport {
    type Target = dyn TransportInner;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Where a transport pushes its results.
#[derive(Clone)]
pub struct ResultSink {
    coordinator: Weak<CoordinatorInner>,
    operation: OperationId,
    epoch: Epoch,
}

impl ResultSink {
    pub(crate) fn new(coordinator: Weak<CoordinatorInner>, operation: OperationId, epoch: Epoch) -> Self {
        ResultSink {
            coordinator,
            operation,
            epoch,
        }
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn send(&self, result: RawResult) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.deliver(self.operation, self.epoch, result);
        }
    }

    pub fn next(&self, payload: impl Into<Payload>) {
        self.send(RawResult::Next(payload.into()));
    }

    /// Shorthand for a complete, non-incremental result.
    pub fn data(&self, data: Value) {
        self.send(RawResult::data(data));
    }

    pub fn error(&self, error: TransportError) {
        self.send(RawResult::Error(error));
    }

    pub fn complete(&self) {
        self.send(RawResult::Complete);
    }

    /// Whether results pushed into this sink can still reach anyone: the
    /// operation exists, was not restarted and has not ended.
    pub fn is_active(&self) -> bool {
        self.coordinator
            .upgrade()
            .is_some_and(|coordinator| coordinator.is_accepting(self.operation, self.epoch))
    }
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSink")
            .field("operation", &self.operation)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Stops a running transport. Unsubscribing twice is a no-op, dropping the value
/// unsubscribes.
#[must_use]
pub struct TransportSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl TransportSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        TransportSubscription {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// For transports that finished synchronously and hold nothing.
    pub fn finished() -> Self {
        TransportSubscription { unsubscribe: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.unsubscribe.is_none()
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for TransportSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSubscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}
