use std::time::Duration;

use raft_rig::Tracker;
use tokio::sync::mpsc;

fn new_tracker(n: u64) -> (Tracker, Vec<mpsc::Sender<bool>>) {
    let mut tracker = Tracker::new();
    let mut senders = Vec::new();
    for id in 0..n {
        let (tx, rx) = mpsc::channel(1);
        tracker.track(id, rx);
        senders.push(tx);
    }
    (tracker, senders)
}

#[tokio::test]
async fn test_acquired() {
    let (mut tracker, senders) = new_tracker(3);

    let future = tracker.expect(0, Duration::from_millis(100));
    senders[0].send(true).await.unwrap();
    future.done().await.unwrap();
    tracker.close();
}

#[tokio::test]
async fn test_acquired_timeout() {
    let (mut tracker, _senders) = new_tracker(1);

    let future = tracker.expect(0, Duration::from_nanos(1));
    let err = future.done().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "server 0: leadership not acquired within 1ns"
    );
    tracker.close();
}

#[tokio::test]
#[should_panic(expected = "server 0 has already requested leadership")]
async fn test_expect_while_leadership_outstanding_panics() {
    let (mut tracker, senders) = new_tracker(3);

    let future = tracker.expect(0, Duration::from_millis(100));
    senders[0].send(true).await.unwrap();
    future.done().await.unwrap();

    tracker.expect(1, Duration::from_millis(1));
}

#[tokio::test]
async fn test_acquired_after_lost() {
    let (mut tracker, senders) = new_tracker(3);

    let future = tracker.expect(0, Duration::from_millis(100));
    senders[0].send(true).await.unwrap();
    let leadership = future.done().await.unwrap();

    senders[0].send(false).await.unwrap();
    leadership.lost().await;

    tracker.expect(1, Duration::from_nanos(1));
    tracker.close();
}

#[tokio::test]
#[should_panic(expected = "an observer for server 0 is already registered")]
async fn test_track_same_server_twice_panics() {
    let (mut tracker, _senders) = new_tracker(1);

    let (_tx, rx) = mpsc::channel(1);
    tracker.track(0, rx);
}

#[tokio::test]
#[should_panic(expected = "can't track new server while observing")]
async fn test_track_after_observing_panics() {
    let (mut tracker, _senders) = new_tracker(1);

    let _future = tracker.expect(0, Duration::from_millis(100));

    let (_tx, rx) = mpsc::channel(1);
    tracker.track(1, rx);
}

#[tokio::test]
#[should_panic(expected = "server 9 is not registered")]
async fn test_expect_unknown_server_panics() {
    let (mut tracker, _senders) = new_tracker(1);
    tracker.expect(9, Duration::from_millis(1));
}
