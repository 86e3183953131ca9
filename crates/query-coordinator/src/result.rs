use serde_json::{Map, Value};

use crate::error::{ClientError, GraphqlError, TransportError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkStatus {
    /// First request in flight, nothing received yet.
    #[default]
    Loading,
    /// A restart is in flight. Queries keep their previous data meanwhile.
    Refetch,
    /// At least one result received, no error surfaced.
    Ready,
    /// An error is surfaced with the result.
    Error,
}

impl NetworkStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, NetworkStatus::Loading | NetworkStatus::Refetch)
    }
}

/// The accumulated, policy-neutral state of one operation epoch: every data
/// chunk merged in and every error kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedResult {
    pub data: Option<Value>,
    pub errors: Vec<GraphqlError>,
    pub extensions: Option<Map<String, Value>>,
    /// Set when the transport failed, which always ends the epoch.
    pub transport_error: Option<TransportError>,
    pub network_status: NetworkStatus,
    /// More incremental payloads are expected.
    pub has_next: bool,
    /// No further result will be produced in this epoch.
    pub terminal: bool,
}

impl MergedResult {
    pub fn loading() -> Self {
        MergedResult::default()
    }

    /// State right after a restart, optionally keeping the previous data visible.
    pub fn refetching(data: Option<Value>) -> Self {
        MergedResult {
            data,
            network_status: NetworkStatus::Refetch,
            ..Default::default()
        }
    }

    /// A terminal result read from the cache.
    pub fn from_cache(data: Value) -> Self {
        MergedResult {
            data: Some(data),
            network_status: NetworkStatus::Ready,
            terminal: true,
            ..Default::default()
        }
    }

    pub fn is_loading(&self) -> bool {
        self.network_status.is_in_flight()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.transport_error.is_some()
    }

    pub fn client_error(&self) -> Option<ClientError> {
        self.has_errors()
            .then(|| ClientError::new(self.errors.clone(), self.transport_error.as_ref()))
    }
}

/// What a subscriber observes: a [`MergedResult`] after its error policy was applied.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub loading: bool,
    pub data: Option<Value>,
    pub error: Option<ClientError>,
    pub network_status: NetworkStatus,
}

impl OperationResult {
    /// The result of a skipped or not yet started subscription.
    pub fn idle() -> Self {
        OperationResult {
            loading: false,
            data: None,
            error: None,
            network_status: NetworkStatus::Ready,
        }
    }

    pub fn loading() -> Self {
        OperationResult {
            loading: true,
            data: None,
            error: None,
            network_status: NetworkStatus::Loading,
        }
    }

    pub fn ready(data: Value) -> Self {
        OperationResult {
            loading: false,
            data: Some(data),
            error: None,
            network_status: NetworkStatus::Ready,
        }
    }

    pub fn is_settled(&self) -> bool {
        !self.loading
    }
}
