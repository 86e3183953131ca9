use crate::{
    error::ClientError,
    result::{MergedResult, NetworkStatus, OperationResult},
};

/// Decides what a subscriber sees of a result carrying errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorPolicy {
    /// Any error discards the data and ends the subscriber with the error.
    #[default]
    None,
    /// Errors are dropped, data is kept.
    Ignore,
    /// Data and errors are both surfaced.
    All,
}

/// How a projected result affects the subscriber that observes it.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Continue,
    Completed,
    Errored(ClientError),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Continue)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filtered {
    pub result: OperationResult,
    pub outcome: Outcome,
}

/// Projects an accumulated result through an error policy.
///
/// Transport failures always end the underlying operation. Under `ignore` that
/// end is reported as a completion, under `none` and `all` as an error.
pub fn filter(policy: ErrorPolicy, merged: &MergedResult) -> Filtered {
    let completion = if merged.terminal {
        Outcome::Completed
    } else {
        Outcome::Continue
    };

    let Some(error) = merged.client_error() else {
        return Filtered {
            result: OperationResult {
                loading: merged.is_loading(),
                data: merged.data.clone(),
                error: None,
                network_status: merged.network_status,
            },
            outcome: completion,
        };
    };

    match policy {
        ErrorPolicy::None => Filtered {
            result: OperationResult {
                loading: false,
                data: None,
                error: Some(error.clone()),
                network_status: NetworkStatus::Error,
            },
            outcome: Outcome::Errored(error),
        },
        ErrorPolicy::Ignore => Filtered {
            result: OperationResult {
                loading: false,
                data: merged.data.clone(),
                error: None,
                network_status: NetworkStatus::Ready,
            },
            outcome: completion,
        },
        ErrorPolicy::All => {
            let outcome = if merged.transport_error.is_some() {
                Outcome::Errored(error.clone())
            } else {
                completion
            };

            Filtered {
                result: OperationResult {
                    loading: false,
                    data: merged.data.clone(),
                    error: Some(error),
                    network_status: NetworkStatus::Error,
                },
                outcome,
            }
        }
    }
}
