//! Connection Supervisor Tests
//!
//! Exercises the supervisor against a scripted transport:
//! - at most one open connection, for any interleaving of `start`
//! - timed retry while online, edge-triggered retry while offline
//! - per-message failures, duplicate deliveries and fatal errors
//! - first-run sync on a linked device

mod common;

use common::{no_connection_error, registered_settings, unregistered_settings, wait_until, MockFactory};
use serde_json::json;
use signal_intake::storage::keys;
use signal_intake::{
    ConnectionState, ConnectionSupervisor, ConversationKind, IntakeConfig, IntakeError,
    IntakeSignal, MemoryStore, RawEvent, ReplayFactory, SettingsStore, WatchNetworkMonitor,
    NO_CONNECTION_STATUS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;

fn test_config() -> IntakeConfig {
    IntakeConfig::default()
        .with_retry_delay(Duration::from_millis(20))
        .with_sync_timeout(Duration::from_millis(50))
}

struct Harness {
    supervisor: ConnectionSupervisor,
    faults: mpsc::UnboundedReceiver<IntakeError>,
    factory: Arc<MockFactory>,
    network: Arc<WatchNetworkMonitor>,
    settings: Arc<MemoryStore>,
    records: Arc<MemoryStore>,
}

fn harness(config: IntakeConfig, settings: Arc<MemoryStore>, factory: MockFactory, online: bool) -> Harness {
    let factory = Arc::new(factory);
    let network = Arc::new(WatchNetworkMonitor::new(online));
    let records = Arc::new(MemoryStore::new());
    let (supervisor, faults) = ConnectionSupervisor::spawn(
        config,
        settings.clone(),
        records.clone(),
        factory.clone(),
        network.clone(),
    );
    Harness {
        supervisor,
        faults,
        factory,
        network,
        settings,
        records,
    }
}

#[tokio::test]
async fn test_start_requires_registration() {
    let settings = unregistered_settings("+1000").await;
    let h = harness(test_config(), settings, MockFactory::new(vec![]), true);

    h.supervisor.start(false).await.unwrap();

    assert_eq!(h.factory.opens(), 0);
    assert_eq!(h.supervisor.state(), ConnectionState::Stopped);
    assert_eq!(h.supervisor.socket_status().await, NO_CONNECTION_STATUS);
}

#[tokio::test]
async fn test_socket_status_reflects_connection() {
    let settings = registered_settings("+1000").await;
    let h = harness(test_config(), settings, MockFactory::new(vec![]), true);

    assert_eq!(h.supervisor.socket_status().await, -1);
    h.supervisor.start(false).await.unwrap();
    assert_eq!(h.supervisor.socket_status().await, 1);
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);

    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.socket_status().await, -1);
    assert_eq!(h.factory.open_now(), 0);
}

#[tokio::test]
async fn test_concurrent_starts_keep_one_connection() {
    let settings = registered_settings("+1000").await;
    let factory = MockFactory::new(vec![]).with_open_delay(Duration::from_millis(2));
    let h = harness(test_config(), settings, factory, true);

    let tasks = (0..10).map(|_| {
        let supervisor = h.supervisor.clone();
        tokio::spawn(async move { supervisor.start(false).await })
    });
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(h.factory.opens(), 10);
    assert_eq!(h.factory.max_open(), 1);
    assert_eq!(h.factory.open_now(), 1);
}

#[tokio::test]
async fn test_error_with_envelope_creates_private_conversation() {
    let settings = registered_settings("+1000").await;
    let error = RawEvent::new(
        "error",
        json!({
            "error": { "name": "IncomingIdentityKeyError", "message": "identity key changed" },
            "proto": { "source": "+1555", "timestamp": 1000 }
        }),
    );
    let h = harness(test_config(), settings, MockFactory::new(vec![vec![error]]), true);
    let reconciler = h.supervisor.reconciler().clone();

    h.supervisor.start(false).await.unwrap();
    wait_until("error conversation", || {
        let reconciler = reconciler.clone();
        async move { reconciler.conversation("+1555").await.is_some() }
    })
    .await;

    let conversation = reconciler.conversation("+1555").await.unwrap();
    assert_eq!(conversation.kind, ConversationKind::Private);
    assert_eq!(conversation.unread_count, 1);
    assert_eq!(conversation.timestamp, Some(1000));

    // the connection stays open
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);

    reconciler.save_queue().flush().await.unwrap();
    let messages = h.records.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].errors[0].name, "IncomingIdentityKeyError");
}

#[tokio::test]
async fn test_counter_mismatch_is_silently_dropped() {
    let settings = registered_settings("+1000").await;
    let mismatch = RawEvent::new(
        "error",
        json!({
            "error": { "name": "MessageCounterError", "message": "duplicate" },
            "proto": { "source": "+1555", "timestamp": 1000 }
        }),
    );
    let receipt = RawEvent::new(
        "receipt",
        json!({ "source": "+1555", "sourceDevice": 1, "timestamp": 1000 }),
    );
    let h = harness(
        test_config(),
        settings,
        MockFactory::new(vec![vec![mismatch, receipt]]),
        true,
    );
    let mut signals = h.supervisor.signals().subscribe();
    let receipts = h.supervisor.receipts().clone();

    h.supervisor.start(false).await.unwrap();
    wait_until("receipt after mismatch", || {
        let receipts = receipts.clone();
        async move { !receipts.deliveries().await.is_empty() }
    })
    .await;

    let reconciler = h.supervisor.reconciler();
    reconciler.save_queue().flush().await.unwrap();
    assert!(reconciler.inbox().await.is_empty());
    assert_eq!(h.records.conversation_save_count().await, 0);
    assert!(h.records.messages().await.is_empty());

    // only connection state changes were signalled
    while let Ok(signal) = signals.try_recv() {
        assert!(matches!(signal, IntakeSignal::ConnectionState(_)));
    }
}

#[tokio::test]
async fn test_no_connection_while_online_retries_once() {
    let settings = registered_settings("+1000").await;
    let script = vec![
        no_connection_error(),
        no_connection_error(),
        no_connection_error(),
    ];
    let h = harness(test_config(), settings, MockFactory::new(vec![script]), true);

    h.supervisor.start(false).await.unwrap();
    let factory = h.factory.clone();
    wait_until("retry", || {
        let factory = factory.clone();
        async move { factory.opens() == 2 }
    })
    .await;

    // repeated errors while a retry was pending did not schedule more
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.factory.opens(), 2);
    assert_eq!(h.factory.max_open(), 1);
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_failed_open_is_retried() {
    let settings = registered_settings("+1000").await;
    let factory = MockFactory::new(vec![]).failing_opens(2);
    let h = harness(test_config(), settings, factory, true);

    h.supervisor.start(false).await.unwrap();
    assert_eq!(h.supervisor.state(), ConnectionState::Reconnecting);

    let factory = h.factory.clone();
    wait_until("third open", || {
        let factory = factory.clone();
        async move { factory.opens() == 3 }
    })
    .await;
    wait_until("connected", || {
        let supervisor = h.supervisor.clone();
        async move { supervisor.state() == ConnectionState::Connected }
    })
    .await;
}

#[tokio::test]
async fn test_retry_cap_gives_up() {
    let settings = registered_settings("+1000").await;
    let factory = MockFactory::new(vec![]).failing_opens(usize::MAX);
    let config = test_config().with_max_retry_attempts(Some(1));
    let h = harness(config, settings, factory, true);

    h.supervisor.start(false).await.unwrap();
    wait_until("give up", || {
        let supervisor = h.supervisor.clone();
        async move { supervisor.state() == ConnectionState::Stopped }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.factory.opens(), 2);
}

#[tokio::test]
async fn test_offline_waits_for_single_online_edge() {
    let settings = registered_settings("+1000").await;
    let h = harness(
        test_config(),
        settings,
        MockFactory::new(vec![vec![no_connection_error()]]),
        false,
    );

    h.supervisor.start(false).await.unwrap();
    wait_until("offline close", || {
        let supervisor = h.supervisor.clone();
        async move { supervisor.state() == ConnectionState::Reconnecting }
    })
    .await;
    assert_eq!(h.factory.open_now(), 0);
    assert_eq!(h.supervisor.socket_status().await, NO_CONNECTION_STATUS);

    // no timed retry while offline
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.factory.opens(), 1);

    h.network.set_online(true);
    let factory = h.factory.clone();
    wait_until("reconnect", || {
        let factory = factory.clone();
        async move { factory.opens() == 2 }
    })
    .await;

    for _ in 0..3 {
        h.network.set_online(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.network.set_online(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.factory.opens(), 2);
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_manual_start_supersedes_pending_retry() {
    let settings = registered_settings("+1000").await;
    let config = test_config().with_retry_delay(Duration::from_millis(80));
    let h = harness(config, settings, MockFactory::new(vec![vec![no_connection_error()]]), true);

    h.supervisor.start(false).await.unwrap();
    wait_until("retry scheduled", || {
        let supervisor = h.supervisor.clone();
        async move { supervisor.state() == ConnectionState::Reconnecting }
    })
    .await;

    h.supervisor.start(false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(h.factory.opens(), 2);
}

#[tokio::test]
async fn test_unhandled_error_reaches_fault_receiver() {
    let settings = registered_settings("+1000").await;
    let fatal = RawEvent::new(
        "error",
        json!({ "error": { "name": "TypeError", "message": "cannot read property" } }),
    );
    let mut h = harness(test_config(), settings, MockFactory::new(vec![vec![fatal]]), true);

    h.supervisor.start(false).await.unwrap();
    let error = tokio::time::timeout(Duration::from_secs(2), h.faults.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(error.is_fatal());
    assert!(error.to_string().contains("TypeError"));
    wait_until("stopped", || {
        let supervisor = h.supervisor.clone();
        async move { supervisor.state() == ConnectionState::Stopped }
    })
    .await;
    assert_eq!(h.supervisor.socket_status().await, NO_CONNECTION_STATUS);
}

#[tokio::test]
async fn test_registration_runs_first_sync() {
    let settings = unregistered_settings("+1000.2").await;
    settings.put(keys::USER_AGENT, json!("OWI")).await.unwrap();
    let factory = MockFactory::new(vec![]).with_sync_delay(Duration::from_millis(5));
    let h = harness(test_config(), settings, factory, true);
    let mut signals = h.supervisor.signals().subscribe();

    let manager = h.supervisor.account_manager().await.unwrap();
    assert_eq!(manager.username(), Some("+1000.2"));
    manager.complete_registration().await.unwrap();

    assert_eq!(h.factory.opens(), 1);
    assert_eq!(
        h.settings.get(keys::SAFETY_NUMBERS_APPROVAL).await.unwrap(),
        Some(json!(false))
    );
    assert_eq!(h.settings.get(keys::THEME_SETTING).await.unwrap(), Some(json!("ios")));

    let synced = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let IntakeSignal::ContactSyncComplete { synced } = signals.recv().await.unwrap() {
                return synced;
            }
        }
    })
    .await
    .unwrap();
    assert!(synced);
    assert!(h.settings.get(keys::SYNCED_AT).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sync_timeout_does_not_persist() {
    let settings = unregistered_settings("+1000.3").await;
    let h = harness(test_config(), settings, MockFactory::new(vec![]), true);
    let mut signals = h.supervisor.signals().subscribe();

    h.supervisor
        .account_manager()
        .await
        .unwrap()
        .complete_registration()
        .await
        .unwrap();

    let mut completions = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Ok(signal)) = tokio::time::timeout_at(deadline, signals.recv()).await {
        if let IntakeSignal::ContactSyncComplete { synced } = signal {
            completions.push(synced);
        }
    }

    assert_eq!(completions, vec![false]);
    assert!(h.settings.get(keys::SYNCED_AT).await.unwrap().is_none());
    // the receive loop is unaffected
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_primary_device_skips_sync_and_approval_kept() {
    let settings = registered_settings("+1000").await;
    let h = harness(test_config(), settings, MockFactory::new(vec![]), true);
    let mut signals = h.supervisor.signals().subscribe();

    h.supervisor
        .account_manager()
        .await
        .unwrap()
        .complete_registration()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    // registration was done before, so approval is left unset
    assert!(h
        .settings
        .get(keys::SAFETY_NUMBERS_APPROVAL)
        .await
        .unwrap()
        .is_none());
    while let Ok(signal) = signals.try_recv() {
        assert!(!matches!(signal, IntakeSignal::ContactSyncComplete { .. }));
    }
}

#[tokio::test]
async fn test_replay_stream_end_stops_supervisor() {
    let settings = registered_settings("+1000").await;
    let input = concat!(
        r#"{"type":"contact","body":{"number":"+1555","name":"Ann","color":"blue"}}"#,
        "\n",
        r#"{"type":"message","body":{"source":"+1555","timestamp":300,"message":{"body":"hi"}}}"#,
        "\n",
        r#"{"type":"message","body":{"source":"+1555","timestamp":200,"message":{"body":"late"}}}"#,
        "\n",
        r#"{"type":"typing","body":{}}"#,
        "\n",
    );
    let factory = Arc::new(ReplayFactory::from_reader(BufReader::new(input.as_bytes())));
    let network = Arc::new(WatchNetworkMonitor::new(true));
    let records = Arc::new(MemoryStore::new());
    let (supervisor, _faults) =
        ConnectionSupervisor::spawn(test_config(), settings, records.clone(), factory, network);
    let mut state = supervisor.watch_state();

    supervisor.start(false).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while *state.borrow_and_update() != ConnectionState::Stopped {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let conversation = supervisor.reconciler().conversation("+1555").await.unwrap();
    assert_eq!(conversation.name.as_deref(), Some("Ann"));
    assert_eq!(conversation.unread_count, 2);
    assert_eq!(conversation.timestamp, Some(300));
    assert_eq!(conversation.last_message.as_deref(), Some("late"));

    supervisor.shutdown().await;
    assert_eq!(records.messages().await.len(), 2);
}

/// Collect `ContactSyncComplete` outcomes seen within `window`
async fn sync_completions(
    signals: &mut tokio::sync::broadcast::Receiver<IntakeSignal>,
    window: Duration,
) -> Vec<bool> {
    let mut completions = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(signal)) = tokio::time::timeout_at(deadline, signals.recv()).await {
        if let IntakeSignal::ContactSyncComplete { synced } = signal {
            completions.push(synced);
        }
    }
    completions
}

#[tokio::test]
async fn test_first_run_sync_survives_failed_open() {
    let settings = unregistered_settings("+1000.2").await;
    settings.put(keys::USER_AGENT, json!("OWI")).await.unwrap();
    let factory = MockFactory::new(vec![])
        .failing_opens(1)
        .with_sync_delay(Duration::from_millis(5));
    let h = harness(test_config(), settings, factory, true);
    let mut signals = h.supervisor.signals().subscribe();

    h.supervisor
        .account_manager()
        .await
        .unwrap()
        .complete_registration()
        .await
        .unwrap();
    assert_eq!(h.supervisor.state(), ConnectionState::Reconnecting);

    let completions = sync_completions(&mut signals, Duration::from_millis(500)).await;

    assert_eq!(completions, vec![true]);
    assert_eq!(h.factory.opens(), 2);
    assert_eq!(h.supervisor.state(), ConnectionState::Connected);
    assert_eq!(h.settings.get(keys::THEME_SETTING).await.unwrap(), Some(json!("ios")));
    assert!(h.settings.get(keys::SYNCED_AT).await.unwrap().is_some());
}

#[tokio::test]
async fn test_first_run_sync_times_out_when_retries_give_up() {
    let settings = unregistered_settings("+1000.2").await;
    let factory = MockFactory::new(vec![])
        .failing_opens(usize::MAX)
        .with_sync_delay(Duration::from_millis(5));
    let config = test_config().with_max_retry_attempts(Some(1));
    let h = harness(config, settings, factory, true);
    let mut signals = h.supervisor.signals().subscribe();

    h.supervisor
        .account_manager()
        .await
        .unwrap()
        .complete_registration()
        .await
        .unwrap();

    let completions = sync_completions(&mut signals, Duration::from_millis(300)).await;

    assert_eq!(completions, vec![false]);
    assert_eq!(h.supervisor.state(), ConnectionState::Stopped);
    assert!(h.settings.get(keys::SYNCED_AT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_never_replaces_a_newer_start() {
    // land the manual start at different points around the retry timer
    for offset_ms in 0..10u64 {
        let settings = registered_settings("+1000").await;
        let factory = MockFactory::new(vec![]).failing_opens(1);
        let config = test_config().with_retry_delay(Duration::from_millis(5));
        let h = harness(config, settings, factory, true);

        h.supervisor.start(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(offset_ms)).await;
        h.supervisor.start(false).await.unwrap();
        let opens_after_start = h.factory.opens();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(h.factory.opens(), opens_after_start, "offset {}ms", offset_ms);
        assert_eq!(h.factory.open_now(), 1);
        assert_eq!(h.supervisor.state(), ConnectionState::Connected);
    }
}
