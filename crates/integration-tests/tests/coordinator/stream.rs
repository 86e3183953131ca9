use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use integration_tests::request;
use query_coordinator::{
    testing::RecordingObserver,
    transport::{StreamTransport, Transport},
    Coordinator, OperationResult, RawResult, SubscriptionState, WatchOptions,
};
use serde_json::json;

/// Every execution emits its sequence number, then stays open.
fn counting_coordinator() -> (Coordinator, Arc<AtomicU64>) {
    let executions = Arc::new(AtomicU64::new(0));

    let transport = StreamTransport::new({
        let executions = executions.clone();
        move |_request| {
            let execution = executions.fetch_add(1, Ordering::SeqCst) + 1;
            futures_util::stream::once(async move { RawResult::data(json!({ "execution": execution })) })
                .chain(futures_util::stream::pending())
                .boxed()
        }
    });

    let coordinator = Coordinator::builder()
        .transport(Transport::new(transport))
        .build()
        .unwrap();

    (coordinator, executions)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn restart_is_shared_by_every_subscriber() {
    let (coordinator, executions) = counting_coordinator();

    let first = RecordingObserver::new();
    let second = RecordingObserver::new();

    let mut a = coordinator.watch(request("subscription { execution }"), WatchOptions::default());
    let mut b = coordinator.watch(request("subscription { execution }"), WatchOptions::default());
    a.subscribe(first.clone()).unwrap();
    b.subscribe(second.clone()).unwrap();
    settle().await;

    a.restart().unwrap();
    settle().await;

    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert_eq!(coordinator.active_operations(), 1);

    for observer in [&first, &second] {
        assert_eq!(observer.data(), Some(json!({ "execution": 2 })));
    }

    assert_eq!(a.state(), SubscriptionState::Active);
    assert_eq!(b.state(), SubscriptionState::Active);
}

#[tokio::test]
async fn the_last_subscriber_leaving_stops_the_stream() {
    let (coordinator, executions) = counting_coordinator();

    let stream = coordinator
        .watch(request("subscription { execution }"), WatchOptions::default())
        .stream()
        .unwrap();

    let mut stream = stream.skip_while(|result| futures_util::future::ready(result.loading));
    assert_eq!(
        stream.next().await,
        Some(OperationResult::ready(json!({ "execution": 1 })))
    );

    drop(stream);
    settle().await;
    assert_eq!(coordinator.active_operations(), 0);

    let result = coordinator.query(request("subscription { execution }")).await.unwrap();
    assert_eq!(result.data, Some(json!({ "execution": 2 })));
    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_ends_every_stream() {
    let (coordinator, _) = counting_coordinator();

    let mut stream = coordinator
        .watch(request("subscription { execution }"), WatchOptions::default())
        .stream()
        .unwrap();

    assert_eq!(stream.next_settled().await.and_then(|result| result.data), Some(json!({ "execution": 1 })));

    coordinator.shutdown();

    assert_eq!(stream.next().await, None);
    assert_eq!(stream.subscription().state(), SubscriptionState::Completed);
    assert_eq!(coordinator.active_operations(), 0);
}
