use std::time::Duration;

use indoc::formatdoc;
use integration_tests::{coordinator, graphql_server, request, GRAPHQL_PATH};
use query_coordinator::{
    Coordinator, CoordinatorConfig, ErrorKind, ErrorPolicy, FetchPolicy, NetworkStatus, OperationResult, WatchOptions,
};
use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

#[tokio::test]
async fn single_query() {
    let server = graphql_server(ResponseTemplate::new(200).set_body_json(json!({ "data": { "hello": "world" } }))).await;
    let coordinator = coordinator(&server, "");

    let result = coordinator.query(request("{ hello }")).await.unwrap();

    assert_eq!(result, OperationResult::ready(json!({ "hello": "world" })));
}

#[tokio::test]
async fn request_carries_variables_and_configured_headers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(GRAPHQL_PATH))
        .and(header("x-api-key", "secret"))
        .and(body_partial_json(json!({
            "query": "query User($id: ID!) { user(id: $id) { name } }",
            "operationName": "User",
            "variables": { "id": "1" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "user": { "name": "Ada" } } })))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = coordinator_with_headers(&server);
    let result = coordinator
        .query(request("query User($id: ID!) { user(id: $id) { name } }").variables(json!({ "id": "1" })))
        .await
        .unwrap();

    assert_eq!(result.data, Some(json!({ "user": { "name": "Ada" } })));
}

fn coordinator_with_headers(server: &MockServer) -> Coordinator {
    let url = format!("{}{GRAPHQL_PATH}", server.uri());
    let config = CoordinatorConfig::from_toml(&formatdoc! {r#"
        [http]
        url = "{url}"
        timeout = "5s"
        headers = {{ "x-api-key" = "secret" }}
    "#})
    .unwrap();

    assert_eq!(config.http.as_ref().unwrap().timeout, Some(Duration::from_secs(5)));

    Coordinator::builder().config(config).build().unwrap()
}

#[tokio::test]
async fn server_failures_are_network_errors() {
    let server = graphql_server(ResponseTemplate::new(500)).await;
    let coordinator = coordinator(&server, "");

    let result = coordinator.query(request("{ hello }")).await.unwrap();

    assert_eq!(result.network_status, NetworkStatus::Error);
    assert_eq!(result.data, None);

    let error = result.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::Network);
    insta::assert_snapshot!(error.message, @"Response not successful: Received status code 500");
}

#[tokio::test]
async fn graphql_errors_follow_the_error_policy() {
    let server = graphql_server(ResponseTemplate::new(200).set_body_json(json!({
        "data": { "hello": null },
        "errors": [{ "message": "hello failed", "path": ["hello"] }]
    })))
    .await;
    let coordinator = coordinator(&server, "");

    let all = coordinator
        .query_with(
            request("{ hello }"),
            WatchOptions::default().error_policy(ErrorPolicy::All),
        )
        .await
        .unwrap();

    insta::assert_json_snapshot!(all, @r###"
    {
      "loading": false,
      "data": {
        "hello": null
      },
      "error": {
        "message": "hello failed",
        "graphqlErrors": [
          {
            "message": "hello failed",
            "path": [
              "hello"
            ]
          }
        ],
        "protocolErrors": [],
        "networkError": null
      },
      "networkStatus": "error"
    }
    "###);

    let none = coordinator
        .query_with(
            request("{ hello }"),
            WatchOptions::default().fetch_policy(FetchPolicy::NetworkOnly),
        )
        .await
        .unwrap();

    assert_eq!(none.data, None);
    assert_eq!(none.error.unwrap().kind(), ErrorKind::Graphql);
}

#[tokio::test]
async fn concurrent_identical_queries_share_one_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(GRAPHQL_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "hello": "world" } }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = coordinator(&server, "");

    let (first, second) = tokio::join!(
        coordinator.query(request("{ hello }")),
        coordinator.query(request("{ hello }")),
    );

    assert_eq!(first.unwrap(), second.unwrap());
}

#[tokio::test]
async fn cached_results_are_served_without_a_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(GRAPHQL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "me": { "__typename": "User", "id": "1", "name": "Ada" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = coordinator(&server, r#"teardown_delay = "1ms""#);
    let me = || request("{ me { id name } }");

    let first = coordinator.query(me()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.active_operations(), 0);

    let second = coordinator.query(me()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        coordinator.cache().entity("User:1"),
        Some(json!({ "__typename": "User", "id": "1", "name": "Ada" }))
    );
}
