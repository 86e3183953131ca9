use futures_util::{stream::BoxStream, StreamExt};

use super::{ResultSink, TransportInner, TransportSubscription};
use crate::{document::OperationRequest, error::TransportError, payload::RawResult};

/// Drives a stream of raw results per request on a tokio runtime.
///
/// The stream ending counts as a completion.
pub struct StreamTransport<F> {
    factory: F,
    runtime: Option<tokio::runtime::Handle>,
}

impl<F> StreamTransport<F>
where
    F: Fn(OperationRequest) -> BoxStream<'static, RawResult> + Send + Sync + 'static,
{
    /// Uses the runtime of the calling context, if any.
    pub fn new(factory: F) -> Self {
        StreamTransport {
            factory,
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    pub fn with_runtime(factory: F, runtime: tokio::runtime::Handle) -> Self {
        StreamTransport {
            factory,
            runtime: Some(runtime),
        }
    }
}

impl<F> TransportInner for StreamTransport<F>
where
    F: Fn(OperationRequest) -> BoxStream<'static, RawResult> + Send + Sync + 'static,
{
    fn send(&self, request: OperationRequest, sink: ResultSink) -> TransportSubscription {
        let Some(runtime) = &self.runtime else {
            sink.error(TransportError::network("no async runtime available to drive the transport"));
            return TransportSubscription::finished();
        };

        let mut stream = (self.factory)(request);

        let task = runtime.spawn(async move {
            while let Some(result) = stream.next().await {
                let terminal = result.is_terminal();
                sink.send(result);

                if terminal {
                    return;
                }

                if !sink.is_active() {
                    tracing::debug!(operation = %sink.operation(), "result stream no longer observed, stopping");
                    return;
                }
            }

            sink.complete();
        });

        TransportSubscription::new(move || task.abort())
    }
}
