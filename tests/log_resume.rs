mod common;

use chrono::{TimeZone, Utc};
use common::{config, eventually, next_delta, Failure, LogScript, StubRemote};
use kubedelta::error::Error;
use kubedelta::watch::{CircuitState, SessionState};
use kubedelta::{LogSpec, PodLogManager};
use std::time::Duration;

fn lines(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|l| (*l).to_string()).collect()
}

fn spec() -> LogSpec {
    LogSpec {
        namespace: "prod".into(),
        pod: "web-0".into(),
        container: "app".into(),
        tail_lines: Some(20),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_from_last_seen_and_drops_replays() {
    let remote = StubRemote::new();
    remote.script_log(LogScript::Lines(lines(&[
        "2024-05-01T10:00:00Z starting",
        "2024-05-01T10:00:01Z ready",
    ])));
    remote.script_log(LogScript::Fail(Failure::Timeout));
    remote.script_log(LogScript::Hold(lines(&[
        "2024-05-01T10:00:00Z starting",
        "2024-05-01T10:00:01Z ready",
        "2024-05-01T10:00:02Z serving",
    ])));

    let manager = PodLogManager::new(remote.clone(), config());
    let (id, mut stream) = manager.subscribe(spec()).unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let envelope = next_delta(&mut stream).await;
        seen.push((envelope.seq, envelope.payload.line));
    }
    assert_eq!(
        seen,
        vec![
            (1, "starting".to_string()),
            (2, "ready".to_string()),
            // boundary line at the resume timestamp may repeat
            (3, "ready".to_string()),
            (4, "serving".to_string()),
        ]
    );

    let requests = remote.log_requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].since, None);
    assert_eq!(requests[0].tail_lines, Some(20));
    let resume = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap();
    for request in &requests[1..] {
        assert_eq!(request.since, Some(resume));
        assert_eq!(request.tail_lines, None);
    }

    let stats = manager.session_stats(&id).unwrap().remove(0);
    assert_eq!(stats.connect_attempts, 3);
    assert_eq!(stats.backoff_sleeps, 2);
}

#[tokio::test(start_paused = true)]
async fn test_untimestamped_reconnect_resumes_from_first_connect() {
    let remote = StubRemote::new();
    remote.script_log(LogScript::Lines(lines(&["no timestamp here"])));

    let manager = PodLogManager::new(remote.clone(), config());
    let (_, mut stream) = manager.subscribe(spec()).unwrap();
    let first = next_delta(&mut stream).await;
    assert_eq!(first.payload.timestamp, None);
    assert_eq!(first.payload.line, "no timestamp here");

    eventually(|| remote.log_requests().len() == 2).await;
    let requests = remote.log_requests();
    assert!(requests[1].since.is_some());
    assert_eq!(requests[1].tail_lines, None);
}

#[tokio::test(start_paused = true)]
async fn test_failing_pod_does_not_gate_healthy_tail() {
    let remote = StubRemote::new();
    remote.deny_logs("missing-pod", Failure::NotFound);
    remote.script_log(LogScript::Hold(lines(&["2024-05-01T10:00:00Z up"])));

    let manager = PodLogManager::new(remote.clone(), config());
    let (missing, _missing_stream) = manager
        .subscribe(LogSpec {
            pod: "missing-pod".into(),
            ..spec()
        })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let (healthy, mut healthy_stream) = manager
        .subscribe(LogSpec {
            pod: "healthy-pod".into(),
            ..spec()
        })
        .unwrap();
    assert_eq!(next_delta(&mut healthy_stream).await.payload.line, "up");
    tokio::time::sleep(Duration::from_secs(300)).await;

    let stats = manager.session_stats(&healthy).unwrap().remove(0);
    assert_eq!(stats.state, SessionState::Watching);
    assert_eq!(stats.connect_attempts, 1);
    assert_eq!(stats.breaker_rejections, 0);
    assert!(manager.session_stats(&missing).unwrap()[0].breaker_rejections > 0);

    let breakers = manager.breaker_states();
    assert_eq!(breakers.get("pods/log/healthy-pod/app@prod"), Some(&CircuitState::Closed));
    assert_ne!(breakers.get("pods/log/missing-pod/app@prod"), Some(&CircuitState::Closed));
}

#[tokio::test]
async fn test_missing_container_is_rejected() {
    let manager = PodLogManager::new(StubRemote::new(), config());
    let result = manager.subscribe(LogSpec {
        container: String::new(),
        ..spec()
    });
    assert!(matches!(result, Err(Error::InvalidSpec(_))));
    assert_eq!(manager.subscription_count(), 0);
}
