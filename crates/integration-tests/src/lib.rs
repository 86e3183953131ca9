#![allow(unused_crate_dependencies, clippy::panic)]

use bytes::Bytes;
use futures_util::TryStreamExt;
use query_coordinator::{Coordinator, CoordinatorConfig, Document, OperationRequest};
use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const GRAPHQL_PATH: &str = "/graphql";

#[ctor::ctor]
fn setup_logging() {
    let filter = tracing_subscriber::filter::EnvFilter::builder()
        .parse(std::env::var("RUST_LOG").unwrap_or("query_coordinator=debug".to_string()))
        .unwrap();
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .without_time()
        .init();
}

pub fn request(source: &str) -> OperationRequest {
    OperationRequest::new(Document::parse(source, None).unwrap())
}

/// A server answering every POST to [`GRAPHQL_PATH`] with the template.
pub async fn graphql_server(template: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(GRAPHQL_PATH))
        .respond_with(template)
        .mount(&server)
        .await;

    server
}

/// A coordinator talking to the server. `config` is prepended to the generated
/// `[http]` section.
pub fn coordinator(server: &MockServer, config: &str) -> Coordinator {
    let config = CoordinatorConfig::from_toml(&format!(
        "{config}\n[http]\nurl = \"{}{GRAPHQL_PATH}\"\n",
        server.uri()
    ))
    .unwrap();

    Coordinator::builder().config(config).build().unwrap()
}

/// A `multipart/mixed` response with one JSON part per value.
pub async fn multipart_response(parts: Vec<Value>, boundary: &str) -> ResponseTemplate {
    let parts = futures_util::stream::iter(parts.into_iter().map(|part| {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );

        Ok::<_, String>(multipart_stream::Part {
            headers,
            body: Bytes::from(part.to_string()),
        })
    }));

    let body = multipart_stream::serialize(parts, boundary)
        .map_ok(|chunk| chunk.to_vec())
        .try_concat()
        .await
        .unwrap();

    ResponseTemplate::new(200).set_body_raw(body, &format!("multipart/mixed; boundary=\"{boundary}\""))
}
