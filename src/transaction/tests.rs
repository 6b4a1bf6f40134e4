//! 事务引擎测试
//! Transaction engine tests

use super::*;
use crate::{
    event::{GattEvent, GattStatus},
    testing::{Journal, Script, ScriptedOperation, client_in_state, fast_config},
};
use bytes::Bytes;
use std::{
    sync::{Arc, atomic::AtomicUsize, mpsc as std_mpsc},
    time::Duration,
};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn scripted(name: &'static str, script: Script, journal: &Arc<Journal>) -> ScriptedOperation {
    ScriptedOperation::new(name, script, journal)
}

fn success() -> Script {
    Script::Immediate(TransactionStatus::Success)
}

#[tokio::test]
async fn test_connect_while_connected_is_invalid_state() {
    let client = client_in_state(GattState::Connected, fast_config());
    let result = client
        .run_tx_and_wait(Transaction::new(&client, ConnectOperation::new()))
        .await
        .unwrap();

    assert_eq!(result.status(), TransactionStatus::InvalidState);
    assert_eq!(result.gatt_state(), GattState::Connected);
    assert_eq!(result.transaction_name(), "connect");
    assert_eq!(client.gatt_state(), GattState::Connected);
}

#[tokio::test]
async fn test_connect_without_callback_times_out() {
    let client = client_in_state(GattState::Disconnected, fast_config());
    let tx = Arc::new(Transaction::new(&client, ConnectOperation::new()));

    let result = client.run_tx_and_wait(tx.clone()).await.unwrap();

    assert_eq!(result.status(), TransactionStatus::Timeout);
    assert_eq!(result.gatt_state(), GattState::Disconnected);
    assert!(tx.is_halted());
    // 超时处理会释放原生句柄
    assert!(client.native_handle().is_none());
}

#[tokio::test]
async fn test_commit_on_main_thread_is_usage_error() {
    let config = fast_config().with_main_thread(std::thread::current().id());
    let client = client_in_state(GattState::Idle, config);
    let journal = Arc::new(Journal::default());
    let tx = Transaction::new(&client, scripted("read", success(), &journal));

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let err = tx
        .commit(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CommitOnMainThread));
    assert!(err.is_usage_error());
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert!(journal.executed().is_empty());
    assert!(!tx.is_started());
}

#[tokio::test]
async fn test_radio_off_rejects_ordinary_but_allows_reset() {
    let client = client_in_state(GattState::BtOff, fast_config());
    let journal = Arc::new(Journal::default());

    let result = client
        .run_tx_and_wait(Transaction::new(&client, scripted("read", success(), &journal)))
        .await
        .unwrap();
    assert_eq!(result.status(), TransactionStatus::InvalidState);
    assert!(journal.executed().is_empty());

    let result = client
        .run_tx_and_wait(Transaction::new(
            &client,
            SetClientStateOperation::new(GattState::Disconnected),
        ))
        .await
        .unwrap();
    assert_eq!(result.status(), TransactionStatus::Success);
    assert_eq!(client.gatt_state(), GattState::Disconnected);
}

#[tokio::test]
async fn test_double_commit_is_usage_error() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let tx = Arc::new(Transaction::new(&client, scripted("read", success(), &journal)));

    let first = client.run_tx_and_wait(tx.clone()).await.unwrap();
    assert!(first.is_success());

    let err = client.run_tx(tx.clone(), |_| {}).unwrap_err();
    assert!(matches!(err, Error::AlreadyCommitted("read")));
    let err = tx.commit(|_| {}).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyCommitted("read")));
    assert_eq!(journal.executed(), vec!["read"]);
}

#[tokio::test]
async fn test_missing_connection_is_usage_error() {
    let journal = Arc::new(Journal::default());
    let tx = Transaction::detached(scripted("read", success(), &journal));
    let err = tx.commit(|_| {}).await.unwrap_err();
    assert!(matches!(err, Error::MissingConnection("read")));

    // 子事务缺少连接同样是使用错误
    let client = client_in_state(GattState::Idle, fast_config());
    let tx = Transaction::new(&client, scripted("write", success(), &journal))
        .with_pre_commit(Transaction::detached(scripted("orphan", success(), &journal)));
    let err = tx.commit(|_| {}).await.unwrap_err();
    assert!(matches!(err, Error::MissingConnection("orphan")));
    assert!(journal.executed().is_empty());
}

#[tokio::test]
async fn test_foreign_connection_is_rejected() {
    let owner = client_in_state(GattState::Idle, fast_config());
    let other = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());

    let tx = Transaction::new(&owner, scripted("read", success(), &journal));
    let err = other.run_tx(tx, |_| {}).unwrap_err();
    assert!(matches!(err, Error::ConnectionMismatch("read")));
}

#[tokio::test]
async fn test_pre_and_post_commit_chain() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let tx = Transaction::new(&client, scripted("main", success(), &journal))
        .with_pre_commit(Transaction::new(&client, scripted("pre", success(), &journal)))
        .with_post_commit(Transaction::new(&client, scripted("post", success(), &journal)));

    let result = client.run_tx_and_wait(tx).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.transaction_name(), "post");
    let names: Vec<_> = result.sub_results().iter().map(|r| r.transaction_name()).collect();
    assert_eq!(names, vec!["pre", "main"]);
    assert_eq!(journal.executed(), vec!["pre", "main", "post"]);
}

#[tokio::test]
async fn test_failing_pre_commit_halts_chain() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let tx = Arc::new(
        Transaction::new(&client, scripted("main", success(), &journal)).with_pre_commit(Transaction::new(
            &client,
            scripted("pre", Script::Immediate(TransactionStatus::Failure), &journal),
        )),
    );

    let result = client.run_tx_and_wait(tx.clone()).await.unwrap();

    assert_eq!(result.status(), TransactionStatus::Failure);
    assert_eq!(result.transaction_name(), "pre");
    assert_eq!(journal.executed(), vec!["pre"]);
    assert!(tx.is_halted());
}

#[tokio::test]
async fn test_result_delivered_exactly_once_under_race() {
    let mut config = fast_config();
    config.transaction.default_timeout = Duration::from_millis(40);
    let client = client_in_state(GattState::Idle, config);
    let journal = Arc::new(Journal::default());
    let delivered = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = std_mpsc::channel();

    const ROUNDS: usize = 20;
    for _ in 0..ROUNDS {
        let op = scripted(
            "racy",
            Script::Delayed(Duration::from_millis(40), TransactionStatus::Success),
            &journal,
        );
        let delivered = delivered.clone();
        let done_tx = done_tx.clone();
        client
            .run_tx(Transaction::new(&client, op), move |result| {
                delivered.fetch_add(1, Ordering::SeqCst);
                done_tx.send(result.status()).unwrap();
            })
            .unwrap();
    }

    for _ in 0..ROUNDS {
        let status = done_rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(status, TransactionStatus::Success | TransactionStatus::Timeout));
    }
    // 给迟到的回调留出时间
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), ROUNDS);
}

#[tokio::test]
async fn test_late_callback_after_timeout_is_inert() {
    let mut config = fast_config();
    config.transaction.default_timeout = Duration::from_millis(50);
    let client = client_in_state(GattState::Idle, config);
    let journal = Arc::new(Journal::default());
    let delivered = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = std_mpsc::channel();

    let counter = delivered.clone();
    let op = scripted(
        "slow",
        Script::Delayed(Duration::from_millis(150), TransactionStatus::Success),
        &journal,
    );
    client
        .run_tx(Transaction::new(&client, op), move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            done_tx.send(result).unwrap();
        })
        .unwrap();

    let result = done_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(result.status(), TransactionStatus::Timeout);
    assert_eq!(result.transaction_name(), "slow");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(journal.timeouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transactions_on_one_connection_never_overlap() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let (done_tx, done_rx) = std_mpsc::channel();
    let names = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7"];

    for name in names {
        let op = scripted(
            name,
            Script::Delayed(Duration::from_millis(5), TransactionStatus::Success),
            &journal,
        );
        let done_tx = done_tx.clone();
        client
            .run_tx(Transaction::new(&client, op), move |result| {
                done_tx.send(result.transaction_name()).unwrap();
            })
            .unwrap();
    }

    let finished: Vec<_> = (0..names.len()).map(|_| done_rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(finished, names);
    assert_eq!(journal.executed(), names);
    assert_eq!(journal.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_intra_transaction_delay_spaces_transactions() {
    let mut config = fast_config();
    config.transaction.intra_transaction_delay = Duration::from_millis(60);
    let client = client_in_state(GattState::Idle, config);
    let journal = Arc::new(Journal::default());

    let started = std::time::Instant::now();
    let first = client.run_tx(Transaction::new(&client, scripted("first", success(), &journal)), |_| {});
    first.unwrap();
    let result = client
        .run_tx_and_wait(Transaction::new(&client, scripted("second", success(), &journal)))
        .await
        .unwrap();

    assert!(result.is_success());
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(journal.executed(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_event_completes_in_flight_and_reaches_listeners() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let listener = client.register_listener(Arc::new(move |event: &GattEvent| {
        if matches!(event, GattEvent::CharacteristicChanged { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let event = GattEvent::CharacteristicChanged {
        service: Uuid::from_u128(1),
        characteristic: Uuid::from_u128(2),
        value: Bytes::from_static(b"hr=72"),
    };
    let feeder_client = client.clone();
    let feeder_event = event.clone();
    let feeder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        feeder_client.handle_gatt_event(feeder_event);
    });

    let tx = Transaction::new(&client, scripted("notify", Script::OnEvent, &journal)).with_timeout(WAIT);
    let result = client.run_tx_and_wait(tx).await.unwrap();
    feeder.await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.data().as_ref(), b"hr=72");
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    assert!(client.unregister_listener(listener));
    client.handle_gatt_event(event);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connection_events_update_state() {
    let client = client_in_state(GattState::Connecting, fast_config());
    client.handle_gatt_event(GattEvent::ConnectionStateChanged {
        status: GattStatus::SUCCESS,
        connected: true,
    });
    assert_eq!(client.gatt_state(), GattState::Connected);

    client.handle_gatt_event(GattEvent::ConnectionStateChanged {
        status: GattStatus(8),
        connected: false,
    });
    assert_eq!(client.gatt_state(), GattState::Disconnected);
    assert!(client.native_handle().is_none());
}

#[tokio::test]
async fn test_composite_runs_all_children_in_order() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let children = vec![
        Transaction::new(&client, scripted("c1", success(), &journal)),
        Transaction::new(&client, scripted("c2", success(), &journal)),
        Transaction::new(&client, scripted("c3", success(), &journal)),
    ];

    let result = client
        .run_tx_and_wait(Transaction::composite(&client, children))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.transaction_name(), "composite");
    let names: Vec<_> = result.sub_results().iter().map(|r| r.transaction_name()).collect();
    assert_eq!(names, vec!["c1", "c2", "c3"]);
    assert_eq!(journal.executed(), vec!["c1", "c2", "c3"]);
}

#[tokio::test]
async fn test_empty_composite_fails_immediately() {
    let client = client_in_state(GattState::Idle, fast_config());
    let started = std::time::Instant::now();

    let result = client
        .run_tx_and_wait(Transaction::composite(&client, Vec::new()))
        .await
        .unwrap();

    assert_eq!(result.status(), TransactionStatus::Failure);
    assert!(result.sub_results().is_empty());
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_composite_stops_at_first_failure() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let children = vec![
        Transaction::new(&client, scripted("c1", success(), &journal)),
        Transaction::new(&client, scripted("c2", Script::Immediate(TransactionStatus::Failure), &journal)),
        Transaction::new(&client, scripted("c3", success(), &journal)),
    ];

    let result = client
        .run_tx_and_wait(Transaction::composite(&client, children))
        .await
        .unwrap();

    assert_eq!(result.status(), TransactionStatus::Failure);
    let statuses: Vec<_> = result.sub_results().iter().map(|r| r.status()).collect();
    assert_eq!(statuses, vec![TransactionStatus::Success, TransactionStatus::Failure]);
    assert_eq!(journal.executed(), vec!["c1", "c2"]);
}

#[tokio::test]
async fn test_composite_child_timeout_fails_composite() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let children = vec![
        Transaction::new(&client, scripted("stuck", Script::Never, &journal)),
        Transaction::new(&client, scripted("never_run", success(), &journal)),
    ];

    let result = client
        .run_tx_and_wait(Transaction::composite(&client, children))
        .await
        .unwrap();

    assert_eq!(result.status(), TransactionStatus::Failure);
    assert_eq!(result.sub_results().len(), 1);
    assert_eq!(result.sub_results()[0].status(), TransactionStatus::Timeout);
    assert_eq!(journal.executed(), vec!["stuck"]);
}

#[tokio::test]
async fn test_composite_timeout_scales_with_children() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let children = (0..4)
        .map(|_| Transaction::new(&client, scripted("child", success(), &journal)))
        .collect();
    let tx = Transaction::composite(&client, children);
    assert_eq!(tx.timeout(), Duration::from_millis(800));
    assert_eq!(Transaction::composite(&client, Vec::new()).timeout(), Duration::from_millis(200));
}

#[tokio::test]
async fn test_resubmitting_queued_transaction_is_rejected() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let delivered = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = std_mpsc::channel();

    // 先占住队列，使后续事务仍在排队
    let blocker = scripted(
        "blocker",
        Script::Delayed(Duration::from_millis(100), TransactionStatus::Success),
        &journal,
    );
    client.run_tx(Transaction::new(&client, blocker), |_| {}).unwrap();

    let tx = Arc::new(Transaction::new(&client, scripted("read", success(), &journal)));
    let counter = delivered.clone();
    client
        .run_tx(tx.clone(), move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            done_tx.send(result.status()).unwrap();
        })
        .unwrap();
    assert!(tx.is_started());

    let counter = delivered.clone();
    let err = client
        .run_tx(tx.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyCommitted("read")));

    assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), TransactionStatus::Success);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(journal.executed(), vec!["blocker", "read"]);
}

#[tokio::test]
async fn test_submission_checks_whole_chain() {
    let owner = client_in_state(GattState::Idle, fast_config());
    let other = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());

    let tx = Arc::new(
        Transaction::new(&owner, scripted("main", success(), &journal))
            .with_post_commit(Transaction::new(&other, scripted("elsewhere", success(), &journal))),
    );
    let err = owner.run_tx(tx.clone(), |_| {}).unwrap_err();
    assert!(matches!(err, Error::ConnectionMismatch("elsewhere")));
    assert!(!tx.is_started());

    let tx = Transaction::new(&owner, scripted("main", success(), &journal))
        .with_pre_commit(Transaction::detached(scripted("orphan", success(), &journal)));
    let err = owner.run_tx(tx, |_| {}).unwrap_err();
    assert!(matches!(err, Error::MissingConnection("orphan")));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(journal.executed().is_empty());
}

#[tokio::test]
async fn test_repeated_event_completes_in_flight_once() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    client.register_listener(Arc::new(move |event: &GattEvent| {
        if matches!(event, GattEvent::CharacteristicChanged { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let delivered = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = std_mpsc::channel();
    let counter = delivered.clone();
    let tx = Transaction::new(&client, scripted("notify", Script::OnEvent, &journal)).with_timeout(WAIT);
    client
        .run_tx(tx, move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            done_tx.send(result).unwrap();
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let event = GattEvent::CharacteristicChanged {
        service: Uuid::from_u128(1),
        characteristic: Uuid::from_u128(2),
        value: Bytes::from_static(b"hr=80"),
    };
    client.handle_gatt_event(event.clone());
    client.handle_gatt_event(event);

    let result = done_rx.recv_timeout(WAIT).unwrap();
    assert!(result.is_success());
    assert_eq!(result.data().as_ref(), b"hr=80");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_late_completion_leaves_state_untouched() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());

    let late = scripted(
        "late",
        Script::Delayed(Duration::from_millis(150), TransactionStatus::Success),
        &journal,
    )
    .settling(GattState::FailureReadingCharacteristic);
    let result = client
        .run_tx_and_wait(Transaction::new(&client, late).with_timeout(Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(result.status(), TransactionStatus::Timeout);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(client.gatt_state(), GattState::Idle);

    // 获胜的结果照常应用状态变更
    let prompt = scripted("prompt", success(), &journal).settling(GattState::DiscoverySuccess);
    let result = client
        .run_tx_and_wait(Transaction::new(&client, prompt))
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(client.gatt_state(), GattState::DiscoverySuccess);
}

#[tokio::test]
async fn test_operation_category_and_target_drive_the_guard() {
    let journal = Arc::new(Journal::default());

    let client = client_in_state(GattState::BtOff, fast_config());
    let reset = scripted("reset", success(), &journal).with_category(TransactionCategory::StateReset);
    let result = client.run_tx_and_wait(Transaction::new(&client, reset)).await.unwrap();
    assert!(result.is_success());

    let client = client_in_state(GattState::Connected, fast_config());
    let reconnect = scripted("reconnect", success(), &journal).targeting(GattState::Connected);
    let result = client
        .run_tx_and_wait(Transaction::new(&client, reconnect))
        .await
        .unwrap();
    assert_eq!(result.status(), TransactionStatus::InvalidState);
    assert_eq!(journal.executed(), vec!["reset"]);
}

#[tokio::test]
async fn test_composite_timeout_stops_running_child() {
    let client = client_in_state(GattState::Idle, fast_config());
    let journal = Arc::new(Journal::default());
    let stuck = Transaction::new(&client, scripted("stuck", Script::Never, &journal))
        .with_timeout(Duration::from_secs(2));
    let composite = Transaction::composite(&client, vec![
        stuck,
        Transaction::new(&client, scripted("never_run", success(), &journal)),
    ])
    .with_timeout(Duration::from_millis(100));

    let (done_tx, done_rx) = std_mpsc::channel();
    let first = done_tx.clone();
    client
        .run_tx(composite, move |result| first.send(result).unwrap())
        .unwrap();
    client
        .run_tx(Transaction::new(&client, scripted("next", success(), &journal)), move |result| {
            done_tx.send(result).unwrap();
        })
        .unwrap();

    let composite = done_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(composite.status(), TransactionStatus::Timeout);
    assert_eq!(composite.transaction_name(), "composite");
    // 子事务在组合事务返回之前已经完成超时处理
    assert_eq!(journal.timeouts.load(Ordering::SeqCst), 1);

    let next = done_rx.recv_timeout(WAIT).unwrap();
    assert!(next.is_success());
    assert_eq!(journal.executed(), vec!["stuck", "next"]);
    assert_eq!(journal.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(client.core().in_flight_len(), 0);
}
