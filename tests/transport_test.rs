use openraft::raft::AppendEntriesRequest;
use openraft::{CommittedLeaderId, Entry, EntryPayload, LogId, Vote};
use raft_rig::{cluster, Network, TypeConfig};

fn entry(term: u64, index: u64, command: bool) -> Entry<TypeConfig> {
    Entry {
        log_id: LogId::new(CommittedLeaderId::new(term, 0), index),
        payload: if command {
            EntryPayload::Normal(Vec::new())
        } else {
            EntryPayload::Blank
        },
    }
}

fn append_req(entries: Vec<Entry<TypeConfig>>) -> AppendEntriesRequest<TypeConfig> {
    AppendEntriesRequest {
        vote: Vote::new_committed(1, 0),
        prev_log_id: None,
        entries,
        leader_commit: None,
    }
}

// By default an append-entries RPC to the target member fails.
#[tokio::test]
async fn test_append_entries_unreachable_by_default() {
    let mut network = Network::new();
    network.add(0);
    network.add(1);
    network.wire();

    let transport = network.transport(0);
    let err = transport
        .append_entries(1, append_req(vec![entry(1, 1, false)]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot reach server 1"));
}

// The append-entries RPC succeeds once the transport is electing.
#[tokio::test]
async fn test_append_entries_connected() {
    let (_rafts, control) = cluster(2).await.unwrap();
    let transport = control.network().transport(0);
    transport.electing();

    let resp = transport
        .append_entries(1, append_req(vec![entry(1, 1, false)]))
        .await
        .unwrap();
    assert!(resp.is_success());
    assert!(transport.has_appended_logs_to(1));
    assert!(control.network().has_appended_logs_from_to(0, 1));

    control.close().await;
}

// Deposing cuts every link; the failure shows up on the next send.
#[tokio::test]
async fn test_deposing_disconnects_all_peers() {
    let (_rafts, control) = cluster(2).await.unwrap();
    let transport = control.network().transport(0);
    transport.electing();

    transport
        .append_entries(1, append_req(vec![entry(1, 1, false)]))
        .await
        .unwrap();

    transport.deposing();
    let err = transport
        .append_entries(1, append_req(vec![entry(1, 2, true)]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot reach server 1"));

    control.close().await;
}

// Only command entries count towards the appended totals.
#[tokio::test]
async fn test_commands_appended_to_counts_commands_only() {
    let (_rafts, control) = cluster(2).await.unwrap();
    let transport = control.network().transport(0);
    transport.electing();

    transport
        .append_entries(1, append_req(vec![entry(1, 1, false), entry(1, 2, true)]))
        .await
        .unwrap();

    assert_eq!(transport.commands_appended_to(1), 1);
    control.close().await;
}

// Disconnecting and reconnecting a peer with no traffic in between leaves
// its tracked log record unchanged.
#[tokio::test]
async fn test_partition_roundtrip_is_idempotent() {
    let (_rafts, control) = cluster(2).await.unwrap();
    let transport = control.network().transport(0);
    transport.electing();

    transport
        .append_entries(1, append_req(vec![entry(1, 1, false), entry(1, 2, true)]))
        .await
        .unwrap();
    let before = transport.tracked_logs(1);

    control.network().disconnect(0, 1);
    control.network().reconnect(0, 1);

    assert_eq!(transport.tracked_logs(1), before);
    assert!(transport.is_connected(1));
    control.close().await;
}

// Arming a second failure event while one is still pending fails loudly.
#[tokio::test]
#[should_panic(expected = "server 0: an event is already scheduled")]
async fn test_schedule_enqueue_failure_twice_panics() {
    let mut network = Network::new();
    network.add(0);
    network.add(1);
    network.wire();

    let transport = network.transport(0);
    let _event = transport.schedule_enqueue_failure(1);
    transport.schedule_enqueue_failure(2);
}

// A scheduled enqueue failure fires the instant the armed command count is
// about to be handed to the wire; the watcher deposes the transport before
// acknowledging, so the send fails.
#[tokio::test]
async fn test_enqueue_failure_event_handshake() {
    let (_rafts, control) = cluster(2).await.unwrap();
    let transport = control.network().transport(0);
    transport.electing();

    transport
        .append_entries(1, append_req(vec![entry(1, 1, false)]))
        .await
        .unwrap();
    assert!(control.network().has_appended_logs_from_to(0, 1));

    let event = control.network().schedule_enqueue_failure(0, 1);

    let watcher = {
        let event = event.clone();
        let transport = control.network().transport(0);
        tokio::spawn(async move {
            event.watch().await;
            transport.deposing();
            event.ack();
        })
    };

    let err = transport
        .append_entries(1, append_req(vec![entry(1, 2, true)]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot reach server 1"));
    assert!(event.is_fired());
    assert!(event.is_acked());

    watcher.await.unwrap();
    control.close().await;
}

// Acting on a member the registry does not know fails loudly.
#[tokio::test]
#[should_panic(expected = "server 7 is not registered")]
async fn test_unregistered_member_panics() {
    let mut network = Network::new();
    network.add(0);
    network.wire();
    network.electing(7);
}
