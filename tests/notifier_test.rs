use std::time::Duration;

use raft_rig::Notifier;
use tokio::sync::mpsc;

fn new_notifier() -> (Notifier, mpsc::Sender<bool>) {
    let (tx, rx) = mpsc::channel(1);
    (Notifier::new(0, rx), tx)
}

#[tokio::test]
async fn test_acquired() {
    let (mut notifier, tx) = new_notifier();

    let future = notifier.acquired(Duration::from_millis(100));
    tx.send(true).await.unwrap();

    let leadership = future.done().await.unwrap();
    assert_eq!(leadership.id(), 0);
    notifier.close();
}

#[tokio::test]
async fn test_acquired_timeout() {
    let (mut notifier, _tx) = new_notifier();

    let future = notifier.acquired(Duration::from_millis(10));
    let err = future.done().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "server 0: leadership not acquired within 10ms"
    );
    notifier.close();
}

#[tokio::test]
async fn test_leadership_lost() {
    let (mut notifier, tx) = new_notifier();

    let future = notifier.acquired(Duration::from_millis(100));
    tx.send(true).await.unwrap();
    let leadership = future.done().await.unwrap();

    tx.send(false).await.unwrap();
    tokio::time::timeout(Duration::from_millis(100), leadership.lost())
        .await
        .expect("no leadership lost notification received");
    assert!(leadership.is_lost());
    notifier.close();
}

#[tokio::test]
async fn test_lost_is_idempotent() {
    let (mut notifier, tx) = new_notifier();

    let future = notifier.acquired(Duration::from_millis(100));
    tx.send(true).await.unwrap();
    let leadership = future.done().await.unwrap();

    tx.send(false).await.unwrap();
    leadership.lost().await;
    leadership.lost().await;
    notifier.close();
}

#[tokio::test]
async fn test_one_leadership_after_the_other() {
    let (mut notifier, tx) = new_notifier();

    let future = notifier.acquired(Duration::from_millis(100));
    tx.send(true).await.unwrap();
    let leadership = future.done().await.unwrap();

    tx.send(false).await.unwrap();
    leadership.lost().await;

    let future = notifier.acquired(Duration::from_millis(100));
    tx.send(true).await.unwrap();
    future.done().await.unwrap();
    notifier.close();
}
