// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - PROCESS POOL INTEGRATION TESTS
//
// Drives a Process Manager worker through its public surface: allocation
// against the pool cap, the waiting list, and the missing-binary path.
// Contract "binaries" are shell scripts that just park, so no sandbox SDK
// is involved.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use forge_engine::config::EngineConfig;
use forge_engine::metrics::EngineMetrics;
use forge_engine::process_manager::{ManagerPair, ProcessManager};
use forge_engine::types::{
    ContractEvent, EngineContext, GroupEvent, GroupHandle, ManagerEvent, PendingTx,
    SchedulerHandle, TxQueue,
};
use forge_engine::users::UserManager;
use forge_protocol::proto::{CrossContext, TxRequest};
use forge_protocol::{ContractKey, MsgType, TxMessage};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

struct Rig {
    ctx: Arc<EngineContext>,
    managers: ManagerPair,
    sched_tx_rx: mpsc::Receiver<PendingTx>,
    _sched_event_rx: mpsc::Receiver<TxMessage>,
    _sched_close_rx: mpsc::Receiver<ContractKey>,
    _chain_rx: mpsc::Receiver<TxMessage>,
    _contract_rx: mpsc::Receiver<ContractEvent>,
    _tmp: tempfile::TempDir,
}

async fn rig(cap: usize) -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Arc::new(EngineConfig {
        max_original_process_num: cap,
        create_sys_users: false,
        enable_isolation: false,
        mount_dir: tmp.path().join("mnt").to_string_lossy().into_owned(),
        log_dir: tmp.path().join("log").to_string_lossy().into_owned(),
        sock_dir: tmp.path().join("sock").to_string_lossy().into_owned(),
        ..Default::default()
    });
    std::fs::create_dir_all(cfg.contract_bins_dir()).unwrap();
    std::fs::create_dir_all(&cfg.log_dir).unwrap();

    let metrics = Arc::new(EngineMetrics::new().unwrap());
    let users = Arc::new(UserManager::new(cfg.clone(), metrics.clone()));
    users.batch_create_users().await.unwrap();

    let (sched_event_tx, sched_event_rx) = mpsc::channel(256);
    let (sched_tx_tx, sched_tx_rx) = mpsc::channel(256);
    let (sched_close_tx, sched_close_rx) = mpsc::channel(8);
    let scheduler = SchedulerHandle {
        event_tx: sched_event_tx,
        tx_tx: sched_tx_tx,
        close_tx: sched_close_tx,
        groups: Arc::new(RwLock::new(HashMap::new())),
    };
    let (chain_tx, chain_rx) = mpsc::channel(256);
    let (contract_tx, contract_rx) = mpsc::channel(256);
    let ctx = Arc::new(EngineContext {
        cfg,
        metrics,
        users,
        scheduler,
        chain_tx,
        contract_tx,
    });

    let orig = ProcessManager::new(ctx.clone(), true);
    let cross = ProcessManager::new(ctx.clone(), false);
    let managers = ManagerPair {
        orig: orig.handle(),
        cross: cross.handle(),
    };
    tokio::spawn(orig.start());
    tokio::spawn(cross.start());

    Rig {
        ctx,
        managers,
        sched_tx_rx,
        _sched_event_rx: sched_event_rx,
        _sched_close_rx: sched_close_rx,
        _chain_rx: chain_rx,
        _contract_rx: contract_rx,
        _tmp: tmp,
    }
}

/// Register a group for `key` and return its handle plus event receiver.
fn register_group(rig: &Rig, key: &ContractKey) -> (GroupHandle, mpsc::Receiver<GroupEvent>) {
    let (event_tx, event_rx) = mpsc::channel(64);
    let (tx_tx, tx_rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = mpsc::channel(1);
    std::mem::forget(tx_rx);
    std::mem::forget(stop_rx);
    let handle = GroupHandle {
        key: key.clone(),
        event_tx,
        tx_tx,
        stop_tx,
        orig_queue: TxQueue::new(64),
        cross_queue: TxQueue::new(64),
    };
    rig.ctx
        .scheduler
        .groups
        .write()
        .unwrap()
        .insert(key.canonical(), handle.clone());
    (handle, event_rx)
}

/// A contract binary that starts and parks: enough for spawn-path tests.
fn write_parked_binary(rig: &Rig, key: &ContractKey) {
    let path = rig.ctx.cfg.contract_bin_path(&key.canonical());
    std::fs::write(&path, b"#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn tx_for(key: &ContractKey, id: &str, depth: u32) -> PendingTx {
    PendingTx::new(TxMessage {
        r#type: MsgType::TxRequest as i32,
        chain_id: key.chain_id.clone(),
        tx_id: id.to_string(),
        cross_context: (depth > 0).then(|| CrossContext {
            process_name: String::new(),
            current_depth: depth,
        }),
        request: Some(TxRequest {
            contract: Some(key.to_contract_id()),
            method: "save".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

async fn recv_with_deadline<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event within deadline")
        .expect("channel open")
}

#[tokio::test]
async fn allocation_is_capped_and_spills_to_the_waiting_list() {
    let rig = rig(2).await;
    let key = ContractKey::new("c1", "counter", "1.0.0", 0);
    let (_handle, mut events) = register_group(&rig, &key);
    write_parked_binary(&rig, &key);

    rig.managers
        .orig
        .event_tx
        .send(ManagerEvent::GetProcessReq {
            key: key.clone(),
            need: 5,
        })
        .await
        .unwrap();

    match recv_with_deadline(&mut events).await {
        GroupEvent::ProcessReady { is_orig, allocated } => {
            assert!(is_orig);
            assert_eq!(allocated, 2);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(rig.managers.orig.live_processes(), 2);
    // The cross pool is untouched by original-side allocation.
    assert_eq!(rig.managers.cross.live_processes(), 0);
}

#[tokio::test]
async fn cross_pool_cap_is_depth_times_the_original_cap() {
    let rig = rig(2).await;
    let key = ContractKey::new("c1", "counter", "1.0.0", 0);
    let (_handle, mut events) = register_group(&rig, &key);
    write_parked_binary(&rig, &key);

    rig.managers
        .cross
        .event_tx
        .send(ManagerEvent::GetProcessReq {
            key: key.clone(),
            need: 100,
        })
        .await
        .unwrap();

    match recv_with_deadline(&mut events).await {
        GroupEvent::ProcessReady { is_orig, allocated } => {
            assert!(!is_orig);
            assert_eq!(allocated, 10); // 2 * depth ceiling of 5
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(rig.managers.cross.live_processes(), 10);
}

#[tokio::test]
async fn missing_binary_condemns_the_contract_and_requeues_the_tx() {
    let mut rig = rig(2).await;
    let key = ContractKey::new("c1", "ghost", "1.0.0", 0);
    let (handle, mut events) = register_group(&rig, &key);
    // No binary on disk. A queued tx rides along so the failure has
    // something to report against.
    handle
        .orig_queue
        .push(tx_for(&key, "tx-1", 0))
        .await
        .unwrap();

    rig.managers
        .orig
        .event_tx
        .send(ManagerEvent::GetProcessReq {
            key: key.clone(),
            need: 1,
        })
        .await
        .unwrap();

    // ProcessReady for the launch and BadContract for the dead binary, in
    // either order.
    let mut saw_bad_contract = false;
    let mut saw_ready = false;
    for _ in 0..2 {
        match recv_with_deadline(&mut events).await {
            GroupEvent::BadContract { tx_id, .. } => {
                assert_eq!(tx_id, "tx-1");
                saw_bad_contract = true;
            }
            GroupEvent::ProcessReady { allocated, .. } => {
                assert_eq!(allocated, 1);
                saw_ready = true;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert!(saw_bad_contract && saw_ready);

    // The tx went back to the Scheduler for a retry after the refetch.
    let requeued = recv_with_deadline(&mut rig.sched_tx_rx).await;
    assert_eq!(requeued.tx_id(), "tx-1");

    // The failed process released its slot and its user.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while rig.managers.orig.live_processes() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "slot not reclaimed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        rig.ctx.metrics.users_available.get() as usize,
        rig.ctx.users.pool_capacity()
    );
}
