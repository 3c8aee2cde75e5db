mod common;

use common::{
    config, eventually, next_delta, object, owned_by, pods, quiet_for, replica_sets, Failure, StubRemote,
};
use kubedelta::config::Config;
use kubedelta::error::Error;
use kubedelta::graph::GraphEdge;
use kubedelta::k8s::RawEvent;
use kubedelta::watch::{CircuitState, SessionState, StreamItem};
use kubedelta::{GraphManager, GraphSpec};
use std::sync::Arc;
use std::time::Duration;

fn spec(kinds: &[&str]) -> GraphSpec {
    GraphSpec {
        kinds: kinds.iter().map(|k| (*k).to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_owner_edge_follows_pod_lifecycle() {
    let remote = StubRemote::new();
    let rs = object(&replica_sets(), "web-5d9", "rs-1", "10");
    let pod = owned_by(object(&pods(), "web-5d9-abc", "pod-1", "11"), &rs);
    remote.set_objects(&replica_sets(), vec![rs.clone()]);
    remote.set_objects(&pods(), vec![pod.clone()]);

    let manager = GraphManager::new(remote.clone(), config());
    let (id, mut stream) = manager.subscribe(spec(&["ReplicaSet", "Pod"])).unwrap();

    // one delta per initial list, in whichever order the two sessions finish
    let first = next_delta(&mut stream).await;
    let second = next_delta(&mut stream).await;
    assert_eq!((first.seq, second.seq), (1, 2));
    let edges: Vec<GraphEdge> = first
        .payload
        .edges_added()
        .chain(second.payload.edges_added())
        .cloned()
        .collect();
    assert_eq!(edges, vec![GraphEdge::new("pod-1", "rs-1", "owner")]);
    assert_eq!(manager.node_count(&id), Some(2));

    eventually(|| remote.watcher_count(&pods()) == 1).await;
    remote.set_objects(&pods(), vec![]);
    remote.emit(&pods(), RawEvent::Deleted(pod));

    let removal = next_delta(&mut stream).await;
    assert_eq!(removal.seq, 3);
    assert_eq!(
        removal.payload.edges_deleted().collect::<Vec<_>>(),
        vec![&GraphEdge::new("pod-1", "rs-1", "owner")]
    );
    assert_eq!(removal.payload.nodes_deleted().count(), 1);
    assert_eq!(manager.node_count(&id), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_relist_after_reconnect_is_silent_when_nothing_changed() {
    let remote = StubRemote::new();
    remote.set_objects(&pods(), vec![object(&pods(), "web-0", "pod-1", "5")]);

    let manager = GraphManager::new(remote.clone(), config());
    let (id, mut stream) = manager.subscribe(spec(&["Pod"])).unwrap();
    assert_eq!(next_delta(&mut stream).await.payload.len(), 1);

    eventually(|| remote.watcher_count(&pods()) == 1).await;
    remote.close_watches(&pods());
    eventually(|| manager.session_stats(&id).unwrap()[0].watch_starts == 2).await;

    assert!(quiet_for(&mut stream, Duration::from_secs(10)).await);
    assert_eq!(remote.list_calls(&pods()), 2);
}

#[tokio::test(start_paused = true)]
async fn test_four_failures_then_success_stays_below_breaker() {
    let remote = StubRemote::new();
    remote.fail_next_lists(&pods(), 4, Failure::Closed);

    let manager = GraphManager::new(remote.clone(), config());
    let (id, _stream) = manager.subscribe(spec(&["Pod"])).unwrap();

    eventually(|| manager.session_stats(&id).unwrap()[0].state == SessionState::Watching).await;
    let stats = manager.session_stats(&id).unwrap().remove(0);
    assert_eq!(stats.connect_attempts, 5);
    assert_eq!(stats.backoff_sleeps, 4);
    assert_eq!(stats.breaker_rejections, 0);
    assert!(manager
        .breaker_states()
        .values()
        .all(|state| *state == CircuitState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_persistent_failure_opens_shared_breaker() {
    let remote = StubRemote::new();
    remote.deny(&pods(), Failure::Forbidden);

    let manager = GraphManager::new(remote.clone(), config());
    let (a, _sa) = manager.subscribe(spec(&["Pod"])).unwrap();
    let (b, _sb) = manager.subscribe(spec(&["Pod"])).unwrap();

    eventually(|| {
        manager
            .breaker_states()
            .values()
            .any(|state| *state == CircuitState::Open)
    })
    .await;
    // both subscriptions share the pods@* breaker, so five failures between them trip it
    assert_eq!(manager.breaker_states().len(), 1);
    eventually(|| {
        [&a, &b]
            .iter()
            .map(|id| manager.session_stats(id).unwrap()[0].breaker_rejections)
            .sum::<u64>()
            > 0
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_leaves_sibling_streaming() {
    let remote = StubRemote::new();
    let manager = GraphManager::new(remote.clone(), config());
    let (a, mut sa) = manager.subscribe(spec(&["Pod"])).unwrap();
    let (_b, mut sb) = manager.subscribe(spec(&["Pod"])).unwrap();
    eventually(|| remote.watcher_count(&pods()) == 2).await;

    manager.unsubscribe(&a).unwrap();
    assert!(sa.recv().await.is_none());
    assert!(matches!(manager.unsubscribe(&a), Err(Error::UnknownSubscription(_))));
    eventually(|| remote.watcher_count(&pods()) == 1).await;

    remote.emit(&pods(), RawEvent::Added(object(&pods(), "web-0", "pod-1", "7")));
    let delta = next_delta(&mut sb).await;
    assert_eq!(delta.seq, 1);
    assert_eq!(manager.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_stream_closes_subscription() {
    let remote = StubRemote::new();
    let manager = GraphManager::new(remote.clone(), config());
    let (id, stream) = manager.subscribe(spec(&["Pod"])).unwrap();
    eventually(|| remote.watcher_count(&pods()) == 1).await;

    drop(stream);
    remote.emit(&pods(), RawEvent::Added(object(&pods(), "web-0", "pod-1", "7")));

    eventually(|| manager.subscription_count() == 0).await;
    assert!(manager.session_stats(&id).is_err());
    eventually(|| remote.watcher_count(&pods()) == 0).await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_stream_on_quiet_watch_stops_session() {
    let remote = StubRemote::new();
    let manager = GraphManager::new(remote.clone(), config());
    let (_, stream) = manager.subscribe(spec(&["Pod"])).unwrap();
    eventually(|| remote.watcher_count(&pods()) == 1).await;

    drop(stream);

    eventually(|| manager.subscription_count() == 0).await;
    eventually(|| manager.live_sessions().is_empty()).await;
    assert_eq!(remote.watcher_count(&pods()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_consumer_lags_without_stalling_fast_one() {
    let remote = StubRemote::new();
    let mut cfg = Config::default();
    cfg.sink_capacity = 4;
    let manager = GraphManager::new(remote.clone(), Arc::new(cfg));

    let (_slow, mut slow) = manager.subscribe(spec(&["Pod"])).unwrap();
    let (_fast, mut fast) = manager.subscribe(spec(&["Pod"])).unwrap();
    eventually(|| remote.watcher_count(&pods()) == 2).await;

    for rv in 1..=20 {
        let pod = object(&pods(), "web-0", "pod-1", &rv.to_string());
        let event = if rv == 1 {
            RawEvent::Added(pod)
        } else {
            RawEvent::Modified(pod)
        };
        remote.emit(&pods(), event);
        assert_eq!(next_delta(&mut fast).await.seq, rv);
    }

    match slow.recv().await {
        Some(StreamItem::Lagged(missed)) => assert_eq!(missed, 16),
        other => panic!("expected lag, got {other:?}"),
    }
    assert_eq!(next_delta(&mut slow).await.seq, 17);
}

#[tokio::test]
async fn test_unknown_kind_is_rejected() {
    let manager = GraphManager::new(StubRemote::new(), config());
    assert!(matches!(
        manager.subscribe(spec(&["CronJob"])),
        Err(Error::InvalidSpec(_))
    ));
    assert!(matches!(manager.subscribe(spec(&[])), Err(Error::InvalidSpec(_))));
    assert_eq!(manager.subscription_count(), 0);
}
