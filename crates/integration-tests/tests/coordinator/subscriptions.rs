use futures_util::StreamExt;
use integration_tests::{coordinator, graphql_server, multipart_response, request};
use query_coordinator::{ErrorKind, NetworkStatus, SubscriptionState, WatchOptions};
use serde_json::json;

#[tokio::test]
async fn multipart_subscription_events() {
    let response = multipart_response(
        vec![
            json!({ "payload": { "data": { "count": 1 } } }),
            // Heartbeat.
            json!({}),
            json!({ "payload": { "data": { "count": 2 } } }),
        ],
        "graphql",
    )
    .await;

    let server = graphql_server(response).await;
    let coordinator = coordinator(&server, "");

    let results = coordinator
        .watch(request("subscription { count }"), WatchOptions::default())
        .stream()
        .unwrap()
        .map(|result| result.data)
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        results,
        vec![None, Some(json!({ "count": 1 })), Some(json!({ "count": 2 }))]
    );
}

#[tokio::test]
async fn protocol_errors_end_the_subscription() {
    let response = multipart_response(
        vec![
            json!({ "payload": { "data": { "count": 1 } } }),
            json!({ "payload": null, "errors": [{ "message": "session expired" }] }),
        ],
        "graphql",
    )
    .await;

    let server = graphql_server(response).await;
    let coordinator = coordinator(&server, "");

    let mut stream = coordinator
        .watch(request("subscription { count }"), WatchOptions::default())
        .stream()
        .unwrap();

    let mut last = None;
    while let Some(result) = stream.next().await {
        last = Some(result);
    }

    let last = last.unwrap();
    assert_eq!(last.network_status, NetworkStatus::Error);
    assert_eq!(stream.subscription().state(), SubscriptionState::Errored);

    let error = last.error.unwrap();
    assert_eq!(error.kind(), ErrorKind::Protocol);
    insta::assert_json_snapshot!(error.protocol_errors, @r###"
    [
      {
        "message": "session expired"
      }
    ]
    "###);
}

#[tokio::test]
async fn first_event_of_a_subscription_query() {
    let response = multipart_response(
        vec![
            json!({ "payload": { "data": { "count": 1 } } }),
            json!({ "payload": { "data": { "count": 2 } } }),
        ],
        "graphql",
    )
    .await;

    let server = graphql_server(response).await;
    let coordinator = coordinator(&server, "");

    let result = coordinator.query(request("subscription { count }")).await.unwrap();

    assert_eq!(result.data, Some(json!({ "count": 1 })));
}
