use futures_util::StreamExt;
use integration_tests::{coordinator, graphql_server, multipart_response, request};
use query_coordinator::{OperationResult, WatchOptions};
use serde_json::json;

#[tokio::test]
async fn deferred_fragments_are_merged_in() {
    let response = multipart_response(
        vec![
            json!({ "data": { "a": { "b": 1 } }, "hasNext": true }),
            json!({ "incremental": [{ "data": { "c": 2 }, "path": ["a"] }], "hasNext": false }),
        ],
        "-",
    )
    .await;

    let server = graphql_server(response).await;
    let coordinator = coordinator(&server, "");

    let results = coordinator
        .watch(request("{ a { b ... @defer { c } } }"), WatchOptions::default())
        .stream()
        .unwrap()
        .map(|result| result.data)
        .collect::<Vec<_>>()
        .await;

    assert_eq!(
        results,
        vec![
            None,
            Some(json!({ "a": { "b": 1 } })),
            Some(json!({ "a": { "b": 1, "c": 2 } })),
        ]
    );
}

#[tokio::test]
async fn streamed_items_are_appended() {
    let response = multipart_response(
        vec![
            json!({ "data": { "users": [{ "name": "Ada" }] }, "hasNext": true }),
            json!({
                "incremental": [
                    { "items": [{ "name": "Grace" }], "path": ["users", 1] },
                    { "items": [{ "name": "Barbara" }], "path": ["users", 2] }
                ],
                "hasNext": true
            }),
            json!({ "hasNext": false }),
        ],
        "-",
    )
    .await;

    let server = graphql_server(response).await;
    let coordinator = coordinator(&server, "");

    let result = coordinator
        .query(request("{ users @stream(initialCount: 1) { name } }"))
        .await
        .unwrap();

    insta::assert_json_snapshot!(result, @r###"
    {
      "loading": false,
      "data": {
        "users": [
          {
            "name": "Ada"
          },
          {
            "name": "Grace"
          },
          {
            "name": "Barbara"
          }
        ]
      },
      "error": null,
      "networkStatus": "ready"
    }
    "###);
}

#[tokio::test]
async fn chunk_errors_are_kept() {
    let response = multipart_response(
        vec![
            json!({ "data": { "a": { "b": 1 } }, "hasNext": true }),
            json!({
                "incremental": [{
                    "data": { "c": null },
                    "path": ["a"],
                    "errors": [{ "message": "c failed", "path": ["a", "c"] }]
                }],
                "hasNext": false
            }),
        ],
        "-",
    )
    .await;

    let server = graphql_server(response).await;
    let coordinator = coordinator(&server, r#"error_policy = "all""#);

    let results = coordinator
        .watch(request("{ a { b ... @defer { c } } }"), WatchOptions::default())
        .stream()
        .unwrap()
        .collect::<Vec<_>>()
        .await;

    let last = results.last().cloned().unwrap();
    assert_eq!(last.data, Some(json!({ "a": { "b": 1, "c": null } })));
    assert_eq!(last.error.unwrap().message, "c failed");

    // The first payload had no error yet.
    assert_eq!(results[1], OperationResult::ready(json!({ "a": { "b": 1 } })));
}
