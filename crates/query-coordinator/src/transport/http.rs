use std::time::Duration;

use futures_util::StreamExt;
use http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderMap, HeaderName, HeaderValue,
};
use serde_json::{Map, Value};
use tracing::Instrument;

use super::{ResultSink, TransportInner, TransportSubscription};
use crate::{
    config::{ConfigError, HttpConfig},
    document::{OperationKind, OperationRequest},
    error::{GraphqlError, TransportError},
    payload::{InitialPayload, Payload, RawResult, SubsequentPayload},
};

const ACCEPT_INCREMENTAL: &str = "multipart/mixed;deferSpec=20220824, application/json";
const ACCEPT_SUBSCRIPTION: &str = "multipart/mixed;boundary=\"graphql\";subscriptionSpec=\"1.0\", application/json";

// Incremental delivery responses default to this boundary when none is given.
const DEFAULT_BOUNDARY: &str = "-";

/// Executes operations as HTTP POST requests.
///
/// Plain `application/json` responses produce a single result. `multipart/mixed`
/// responses are read part by part, each part being either an incremental
/// delivery payload (`@defer`, `@stream`) or a multipart subscription envelope.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: url::Url,
    headers: HeaderMap,
    timeout: Option<Duration>,
    runtime: Option<tokio::runtime::Handle>,
}

pub struct HttpTransportBuilder {
    client: Option<reqwest::Client>,
    url: url::Url,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn builder(url: url::Url) -> HttpTransportBuilder {
        HttpTransportBuilder {
            client: None,
            url,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    pub fn from_config(config: &HttpConfig) -> Result<Self, ConfigError> {
        let mut builder = Self::builder(config.url.clone());

        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
            builder = builder.header(name, value);
        }

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(builder.build())
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

impl HttpTransportBuilder {
    #[must_use]
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Requests are driven on the tokio runtime of the calling context.
    pub fn build(self) -> HttpTransport {
        HttpTransport {
            client: self.client.unwrap_or_default(),
            url: self.url,
            headers: self.headers,
            timeout: self.timeout,
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    variables: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    extensions: &'a Map<String, Value>,
}

impl TransportInner for HttpTransport {
    fn send(&self, request: OperationRequest, sink: ResultSink) -> TransportSubscription {
        let Some(runtime) = &self.runtime else {
            sink.error(TransportError::network("no async runtime available to drive the transport"));
            return TransportSubscription::finished();
        };

        let span = tracing::debug_span!(
            "graphql request",
            url = %self.url,
            operation = %sink.operation(),
            epoch = %sink.epoch(),
            kind = %request.kind(),
            name = request.document.operation_name().unwrap_or_default(),
        );

        let transport = self.clone();
        let task = runtime.spawn(
            async move {
                if let Err(error) = transport.execute(&request, &sink).await {
                    tracing::debug!(kind = %error.kind(), "request failed: {error}");
                    sink.error(error);
                }
            }
            .instrument(span),
        );

        TransportSubscription::new(move || task.abort())
    }
}

impl HttpTransport {
    async fn execute(&self, request: &OperationRequest, sink: &ResultSink) -> Result<(), TransportError> {
        let kind = request.kind();
        let accept = match kind {
            OperationKind::Subscription => ACCEPT_SUBSCRIPTION,
            OperationKind::Query | OperationKind::Mutation => ACCEPT_INCREMENTAL,
        };

        let body = RequestBody {
            query: request.document.source(),
            operation_name: request.document.operation_name(),
            variables: &request.variables,
            extensions: &request.extensions,
        };

        let mut builder = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, accept)
            .json(&body);

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(TransportError::network)?;
        let status = response.status();
        let boundary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(multipart_boundary);

        tracing::debug!(status = status.as_u16(), multipart = boundary.is_some(), "response received");

        let Some(boundary) = boundary else {
            let bytes = response.bytes().await.map_err(TransportError::network)?;
            let payload = match serde_json::from_slice::<InitialPayload>(&bytes) {
                Ok(payload) if payload.data.is_some() || !payload.errors.is_empty() => payload,
                _ if !status.is_success() => return Err(TransportError::Status(status.as_u16())),
                Ok(payload) => payload,
                Err(error) => return Err(TransportError::network(format!("invalid response body: {error}"))),
            };

            sink.next(payload);
            sink.complete();
            return Ok(());
        };

        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let mut parts = Box::pin(multipart_stream::parse(response.bytes_stream(), &boundary));

        while let Some(part) = parts.next().await {
            let part = part.map_err(TransportError::network)?;
            let value = serde_json::from_slice::<Value>(&part.body)
                .map_err(|error| TransportError::network(format!("invalid multipart part: {error}")))?;

            let Some(result) = part_to_result(kind, value)? else {
                continue;
            };

            let terminal = result.is_terminal();
            sink.send(result);

            if terminal || !sink.is_active() {
                return Ok(());
            }
        }

        sink.complete();
        Ok(())
    }
}

/// Extracts the boundary of a `multipart/mixed` content type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';').map(str::trim);

    if !params.next()?.eq_ignore_ascii_case("multipart/mixed") {
        return None;
    }

    let boundary = params
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

    Some(boundary)
}

/// Turns one multipart part into a raw result. Heartbeats produce nothing.
fn part_to_result(kind: OperationKind, value: Value) -> Result<Option<RawResult>, TransportError> {
    let Value::Object(mut object) = value else {
        return Err(TransportError::network("multipart part is not a JSON object"));
    };

    let invalid = |error: serde_json::Error| TransportError::network(format!("invalid multipart part: {error}"));

    if kind == OperationKind::Subscription {
        if object.is_empty() {
            return Ok(None);
        }

        match object.remove("payload") {
            Some(Value::Null) | None if object.contains_key("errors") => {
                let errors = object.remove("errors").unwrap_or_default();
                let errors = serde_json::from_value::<Vec<GraphqlError>>(errors).map_err(invalid)?;
                return Err(TransportError::Protocol(errors));
            }
            Some(Value::Null) => return Ok(None),
            Some(payload) => {
                let payload = serde_json::from_value::<InitialPayload>(payload).map_err(invalid)?;
                return Ok(Some(RawResult::Next(payload.into())));
            }
            None => {}
        }
    }

    if object.contains_key("incremental") {
        let payload = serde_json::from_value::<SubsequentPayload>(Value::Object(object)).map_err(invalid)?;
        return Ok(Some(RawResult::Next(payload.into())));
    }

    if !object.contains_key("data") && !object.contains_key("errors") {
        // A closing `{"hasNext": false}` part.
        let has_next = object.get("hasNext").and_then(Value::as_bool).unwrap_or(false);
        return Ok(Some(RawResult::Next(Payload::Subsequent(SubsequentPayload {
            incremental: Vec::new(),
            has_next,
            extensions: None,
        }))));
    }

    let payload = serde_json::from_value::<InitialPayload>(Value::Object(object)).map_err(invalid)?;
    Ok(Some(RawResult::Next(payload.into())))
}
