//! Deduplicating, cache-backed coordination of GraphQL operations.
//!
//! Every [`Subscription`] watching the same request shares one running
//! operation: one transport subscription, one accumulated result, one restart
//! cycle. Results are merged across incremental payloads, projected through each
//! subscriber's [`ErrorPolicy`] and fanned out in order. The last subscriber
//! leaving does not stop the operation right away, a subscriber arriving within
//! the teardown delay picks it up where it is.

mod cache;
mod callbacks;
mod config;
mod coordinator;
mod document;
mod error;
mod merge;
mod multiplexer;
mod payload;
mod policy;
mod registry;
mod result;
mod scheduler;
mod stream;
mod subscription;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use cache::{CacheRead, FetchPolicy, NormalizedCache};
pub use callbacks::SubscriptionCallbacks;
pub use config::{CacheConfig, ConfigError, CoordinatorConfig, HttpConfig};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use document::{Document, DocumentError, Fingerprint, OperationKind, OperationRequest};
pub use error::{ClientError, CoordinatorError, ErrorKind, GraphqlError, Location, TransportError};
pub use merge::ResultMerger;
pub use multiplexer::Observer;
pub use payload::{IncrementalChunk, InitialPayload, PathSegment, Payload, RawResult, SubsequentPayload};
pub use policy::{filter, ErrorPolicy, Filtered, Outcome};
pub use registry::{Epoch, OperationId, OperationKey, SubscriberId};
pub use result::{MergedResult, NetworkStatus, OperationResult};
#[cfg(any(test, feature = "test-utils"))]
pub use scheduler::ManualScheduler;
pub use scheduler::{Scheduler, SchedulerInner, Task, TaskHandle, TokioScheduler};
pub use stream::ResultStream;
pub use subscription::{Subscription, SubscriptionState, WatchOptions};
