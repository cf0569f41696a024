// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - REQUEST GROUP
//
// One worker per contract key. Owns the two tx queues (original / cross),
// gates routing on the contract binary being on disk, and asks the Process
// Managers for capacity as the queues grow.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::config::TX_QUEUE_SIZE;
use crate::process_manager::ManagerPair;
use crate::types::{now_nanos, ContractEvent, EngineContext, GroupEvent, GroupHandle, ManagerEvent, PendingTx, TxQueue};
use forge_protocol::{error_msg, ContractKey, EngineError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Contract-binary side of the group's state. Routing only happens in
/// `Ready`; everything else buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContractState {
    /// No binary on disk (or it was just condemned).
    Empty,
    /// GET_BYTECODE in flight, deadline armed.
    Fetching,
    /// Binary on disk; `cfv` stamps when it became usable.
    Ready,
}

pub struct RequestGroup {
    ctx: Arc<EngineContext>,
    key: ContractKey,
    canonical: String,
    managers: ManagerPair,
    handle: GroupHandle,
    event_rx: mpsc::Receiver<GroupEvent>,
    tx_rx: mpsc::Receiver<PendingTx>,
    stop_rx: mpsc::Receiver<()>,

    state: ContractState,
    /// Contract file version: wall-clock nanos of the last successful fetch.
    /// Bad-contract reports carrying an older stamp are stale and ignored.
    cfv: i64,
    /// Txs that arrived before the binary was ready.
    pending: Vec<PendingTx>,
    fetch_deadline: Option<tokio::time::Instant>,
    /// At most one GetProcessReq in flight per side; cleared when the
    /// manager answers with ProcessReady.
    orig_requested: bool,
    cross_requested: bool,
}

impl RequestGroup {
    /// Build the worker plus the handle the rest of the engine sees.
    pub fn new(
        ctx: Arc<EngineContext>,
        key: ContractKey,
        managers: ManagerPair,
    ) -> (Self, GroupHandle) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (tx_tx, tx_rx) = mpsc::channel(TX_QUEUE_SIZE);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = GroupHandle {
            key: key.clone(),
            event_tx,
            tx_tx,
            stop_tx,
            orig_queue: TxQueue::new(TX_QUEUE_SIZE),
            cross_queue: TxQueue::new(TX_QUEUE_SIZE),
        };
        let canonical = key.canonical();
        let group = Self {
            ctx,
            key,
            canonical,
            managers,
            handle: handle.clone(),
            event_rx,
            tx_rx,
            stop_rx,
            state: ContractState::Empty,
            cfv: 0,
            pending: Vec::new(),
            fetch_deadline: None,
            orig_requested: false,
            cross_requested: false,
        };
        (group, handle)
    }

    pub async fn start(mut self) {
        println!("📦 [GROUP] {} started", self.canonical);
        loop {
            let fetch_at = self
                .fetch_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                biased;
                _ = self.stop_rx.recv() => {
                    self.drain_exit().await;
                    break;
                }
                ev = self.event_rx.recv() => match ev {
                    Some(ev) => self.handle_event(ev).await,
                    None => break,
                },
                tx = self.tx_rx.recv() => match tx {
                    Some(tx) => self.handle_tx(tx).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(fetch_at), if self.fetch_deadline.is_some() => {
                    self.fetch_timed_out().await;
                }
            }
        }
        println!("📦 [GROUP] {} stopped", self.canonical);
    }

    async fn handle_tx(&mut self, tx: PendingTx) {
        match self.state {
            ContractState::Ready => self.route(tx).await,
            ContractState::Fetching => self.pending.push(tx),
            ContractState::Empty => {
                let tx_id = tx.msg.tx_id.clone();
                self.pending.push(tx);
                self.request_contract(&tx_id).await;
            }
        }
    }

    async fn request_contract(&mut self, tx_id: &str) {
        self.state = ContractState::Fetching;
        self.fetch_deadline =
            Some(tokio::time::Instant::now() + self.ctx.cfg.get_bytecode_timeout());
        if self
            .ctx
            .contract_tx
            .send(ContractEvent::GetContractReq {
                key: self.key.clone(),
                tx_id: tx_id.to_string(),
            })
            .await
            .is_err()
        {
            eprintln!("❌ [GROUP] {} contract manager unavailable", self.canonical);
        }
    }

    async fn handle_event(&mut self, ev: GroupEvent) {
        match ev {
            GroupEvent::ContractReady { ok } => {
                self.fetch_deadline = None;
                if ok {
                    self.state = ContractState::Ready;
                    self.cfv = now_nanos();
                    let pending = std::mem::take(&mut self.pending);
                    for tx in pending {
                        self.route(tx).await;
                    }
                } else {
                    self.state = ContractState::Empty;
                    self.fail_pending(&EngineError::GetBytecode(format!(
                        "chain rejected bytecode for {}",
                        self.canonical
                    )))
                    .await;
                }
            }
            GroupEvent::ProcessReady { is_orig, allocated } => {
                if allocated > 0 {
                    println!(
                        "📦 [GROUP] {} got {} {} processes",
                        self.canonical,
                        allocated,
                        if is_orig { "orig" } else { "cross" }
                    );
                }
                if is_orig {
                    self.orig_requested = false;
                } else {
                    self.cross_requested = false;
                }
                // Capacity may still trail the queue; ask again if so.
                self.request_processes(is_orig).await;
            }
            GroupEvent::BadContract { tx_id, cfv } => {
                if self.state != ContractState::Ready || cfv < self.cfv {
                    // Either the binary is already gone (a fetch may be in
                    // flight) or the report is about a replaced one.
                    println!(
                        "📦 [GROUP] {} ignored stale bad-contract report from tx {}",
                        self.canonical, tx_id
                    );
                    return;
                }
                eprintln!(
                    "⚠️ [GROUP] {} binary condemned by tx {}, evicting",
                    self.canonical, tx_id
                );
                self.ctx.metrics.bad_contract_reports_total.inc();
                self.state = ContractState::Empty;
                self.fetch_deadline = None;
                if self
                    .ctx
                    .contract_tx
                    .send(ContractEvent::BadContract {
                        key: self.key.clone(),
                    })
                    .await
                    .is_err()
                {
                    eprintln!("❌ [GROUP] {} contract manager unavailable", self.canonical);
                }
                // Work is still waiting on this contract; fetch a fresh
                // binary right away instead of stalling until the next tx.
                if !self.pending.is_empty()
                    || !self.handle.orig_queue.is_empty()
                    || !self.handle.cross_queue.is_empty()
                {
                    self.request_contract(&tx_id).await;
                }
            }
        }
    }

    async fn fetch_timed_out(&mut self) {
        self.fetch_deadline = None;
        self.state = ContractState::Empty;
        self.ctx.metrics.bytecode_failures_total.inc();
        eprintln!(
            "⏱️ [GROUP] {} bytecode fetch exceeded {}s",
            self.canonical, self.ctx.cfg.get_bytecode_timeout_secs
        );
        self.fail_pending(&EngineError::GetBytecode(format!(
            "bytecode fetch for {} timed out",
            self.canonical
        )))
        .await;
    }

    async fn fail_pending(&mut self, err: &EngineError) {
        let pending = std::mem::take(&mut self.pending);
        for tx in pending {
            self.ctx
                .scheduler
                .put_event(error_msg(&tx.msg.chain_id, tx.tx_id(), err))
                .await;
            self.ctx.metrics.tx_errors_total.inc();
        }
    }

    async fn route(&mut self, mut tx: PendingTx) {
        let is_orig = tx.msg.current_depth() == 0;
        tx.cfv = self.cfv;
        if let Err(e) = self.handle.queue(is_orig).push(tx).await {
            eprintln!("❌ [GROUP] {} queue rejected tx: {}", self.canonical, e);
            return;
        }
        self.request_processes(is_orig).await;
    }

    /// need = queued txs minus processes that can pick one up soon (bound to
    /// this contract and not currently executing).
    fn compute_need(&self, is_orig: bool) -> usize {
        let queued = self.handle.queue(is_orig).len();
        let (bound, executing) = self.managers.side(is_orig).contract_stats(&self.canonical);
        queued.saturating_sub(bound.saturating_sub(executing))
    }

    async fn request_processes(&mut self, is_orig: bool) {
        let in_flight = if is_orig {
            self.orig_requested
        } else {
            self.cross_requested
        };
        if in_flight {
            // The manager owes us an answer already; asking again with a
            // recomputed need would stack launches for the same txs.
            return;
        }
        let need = self.compute_need(is_orig);
        if need == 0 {
            return;
        }
        if self
            .managers
            .side(is_orig)
            .event_tx
            .send(ManagerEvent::GetProcessReq {
                key: self.key.clone(),
                need,
            })
            .await
            .is_err()
        {
            eprintln!("❌ [GROUP] {} process manager unavailable", self.canonical);
            return;
        }
        if is_orig {
            self.orig_requested = true;
        } else {
            self.cross_requested = true;
        }
    }

    /// Teardown: every buffered or queued tx is answered with a terminal
    /// group-exited error so the chain can retry elsewhere.
    async fn drain_exit(&mut self) {
        self.fail_pending(&EngineError::GroupExited).await;
        for queue in [&self.handle.orig_queue, &self.handle.cross_queue] {
            while let Some(tx) = queue.try_pop() {
                self.ctx
                    .scheduler
                    .put_event(error_msg(&tx.msg.chain_id, tx.tx_id(), &EngineError::GroupExited))
                    .await;
                self.ctx.metrics.tx_errors_total.inc();
            }
        }
        // Late arrivals on the tx channel get the same treatment.
        while let Ok(tx) = self.tx_rx.try_recv() {
            self.ctx
                .scheduler
                .put_event(error_msg(&tx.msg.chain_id, tx.tx_id(), &EngineError::GroupExited))
                .await;
            self.ctx.metrics.tx_errors_total.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::metrics::EngineMetrics;
    use crate::process_manager::ProcessManager;
    use crate::types::SchedulerHandle;
    use crate::users::UserManager;
    use forge_protocol::{proto, MsgType, TxMessage};
    use std::collections::HashMap;
    use std::sync::RwLock;

    struct Harness {
        ctx: Arc<EngineContext>,
        managers: ManagerPair,
        sched_event_rx: mpsc::Receiver<TxMessage>,
        contract_rx: mpsc::Receiver<ContractEvent>,
        _chain_rx: mpsc::Receiver<TxMessage>,
        _sched_tx_rx: mpsc::Receiver<PendingTx>,
        _sched_close_rx: mpsc::Receiver<ContractKey>,
        _orig_event_rx: Option<mpsc::Receiver<ManagerEvent>>,
        _tmp: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Arc::new(EngineConfig {
            max_original_process_num: 4,
            create_sys_users: false,
            enable_isolation: false,
            mount_dir: tmp.path().join("mnt").to_string_lossy().into_owned(),
            log_dir: tmp.path().join("log").to_string_lossy().into_owned(),
            ..Default::default()
        });
        std::fs::create_dir_all(cfg.contract_bins_dir()).unwrap();

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
        // Workers intentionally not started: the tests assert on the
        // GetProcessReq traffic instead.
        let orig_event_rx = Some(orig.into_event_rx());
        drop(cross);

        Harness {
            ctx,
            managers,
            sched_event_rx,
            contract_rx,
            _chain_rx: chain_rx,
            _sched_tx_rx: sched_tx_rx,
            _sched_close_rx: sched_close_rx,
            _orig_event_rx: orig_event_rx,
            _tmp: tmp,
        }
    }

    fn test_key() -> ContractKey {
        ContractKey::new("c1", "counter", "1.0.0", 0)
    }

    fn tx(id: &str, depth: u32) -> PendingTx {
        PendingTx::new(TxMessage {
            r#type: MsgType::TxRequest as i32,
            chain_id: "c1".to_string(),
            tx_id: id.to_string(),
            cross_context: (depth > 0).then(|| proto::CrossContext {
                process_name: String::new(),
                current_depth: depth,
            }),
            request: Some(proto::TxRequest {
                contract: Some(test_key().to_contract_id()),
                method: "save".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn first_tx_triggers_a_bytecode_fetch_and_buffers() {
        let mut h = harness().await;
        let (mut group, _handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());

        group.handle_tx(tx("tx-1", 0)).await;
        group.handle_tx(tx("tx-2", 0)).await;

        assert_eq!(group.state, ContractState::Fetching);
        assert_eq!(group.pending.len(), 2);
        // Exactly one fetch for the two buffered txs.
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::GetContractReq { key, tx_id } => {
                assert_eq!(key, test_key());
                assert_eq!(tx_id, "tx-1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(h.contract_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn contract_ready_routes_buffered_txs_by_depth() {
        let h = harness().await;
        let (mut group, handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());

        group.handle_tx(tx("orig-1", 0)).await;
        group.handle_tx(tx("cross-1", 2)).await;
        group.handle_event(GroupEvent::ContractReady { ok: true }).await;

        assert_eq!(group.state, ContractState::Ready);
        assert!(group.cfv > 0);
        assert_eq!(handle.orig_queue.len(), 1);
        assert_eq!(handle.cross_queue.len(), 1);
        // Routed txs carry the group's contract file version.
        let routed = handle.orig_queue.try_pop().unwrap();
        assert_eq!(routed.cfv, group.cfv);
        assert_eq!(routed.tx_id(), "orig-1");
    }

    #[tokio::test]
    async fn routing_requests_processes_for_the_shortfall() {
        let mut h = harness().await;
        let (mut group, _handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());

        group.handle_event(GroupEvent::ContractReady { ok: true }).await;
        group.handle_tx(tx("tx-1", 0)).await;
        group.handle_tx(tx("tx-2", 0)).await;

        // Only the first routed tx sends a request; the second rides on the
        // one already in flight instead of stacking a larger ask on top.
        let rx = h._orig_event_rx.as_mut().unwrap();
        match rx.recv().await.unwrap() {
            ManagerEvent::GetProcessReq { key, need } => {
                assert_eq!(key, test_key());
                assert_eq!(need, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        // The manager's answer clears the in-flight mark and the group
        // re-asks for what the queue still lacks.
        group
            .handle_event(GroupEvent::ProcessReady {
                is_orig: true,
                allocated: 0,
            })
            .await;
        let rx = h._orig_event_rx.as_mut().unwrap();
        match rx.recv().await.unwrap() {
            ManagerEvent::GetProcessReq { need, .. } => assert_eq!(need, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_fetch_errors_every_buffered_tx() {
        let mut h = harness().await;
        let (mut group, _handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());

        group.handle_tx(tx("tx-1", 0)).await;
        group.handle_tx(tx("tx-2", 3)).await;
        group.handle_event(GroupEvent::ContractReady { ok: false }).await;

        assert_eq!(group.state, ContractState::Empty);
        assert!(group.pending.is_empty());
        for expected in ["tx-1", "tx-2"] {
            let msg = h.sched_event_rx.recv().await.unwrap();
            assert_eq!(msg.msg_type(), MsgType::Error);
            assert_eq!(msg.tx_id, expected);
            assert_eq!(msg.error.unwrap().code, 4); // get-bytecode failure
        }
    }

    #[tokio::test]
    async fn bad_contract_report_is_fenced_by_file_version() {
        let mut h = harness().await;
        let (mut group, _handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());
        group.handle_event(GroupEvent::ContractReady { ok: true }).await;
        let cfv = group.cfv;

        // Stale report (older file version): ignored.
        group
            .handle_event(GroupEvent::BadContract {
                tx_id: "tx-old".to_string(),
                cfv: cfv - 1,
            })
            .await;
        assert_eq!(group.state, ContractState::Ready);
        assert!(h.contract_rx.try_recv().is_err());

        // Current report: evicts and resets.
        group
            .handle_event(GroupEvent::BadContract {
                tx_id: "tx-now".to_string(),
                cfv,
            })
            .await;
        assert_eq!(group.state, ContractState::Empty);
        assert_eq!(h.ctx.metrics.bad_contract_reports_total.get(), 1);
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::BadContract { key } => assert_eq!(key, test_key()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_contract_report_during_a_fetch_is_ignored() {
        let mut h = harness().await;
        let (mut group, _handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());

        group.handle_tx(tx("tx-1", 0)).await;
        assert_eq!(group.state, ContractState::Fetching);
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::GetContractReq { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }

        // A report with the current stamp must not clobber the fetch cycle.
        group
            .handle_event(GroupEvent::BadContract {
                tx_id: "tx-1".to_string(),
                cfv: group.cfv,
            })
            .await;
        assert_eq!(group.state, ContractState::Fetching);
        assert!(group.fetch_deadline.is_some());
        assert!(h.contract_rx.try_recv().is_err());
        assert_eq!(h.ctx.metrics.bad_contract_reports_total.get(), 0);
    }

    #[tokio::test]
    async fn accepted_bad_contract_refetches_while_txs_wait() {
        let mut h = harness().await;
        let (mut group, handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());
        group.handle_event(GroupEvent::ContractReady { ok: true }).await;
        group.handle_tx(tx("tx-1", 0)).await;
        assert_eq!(handle.orig_queue.len(), 1);

        group
            .handle_event(GroupEvent::BadContract {
                tx_id: "tx-1".to_string(),
                cfv: group.cfv,
            })
            .await;

        // Eviction goes out first, then a fresh fetch for the queued work.
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::BadContract { key } => assert_eq!(key, test_key()),
            other => panic!("unexpected event: {:?}", other),
        }
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::GetContractReq { tx_id, .. } => assert_eq!(tx_id, "tx-1"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(group.state, ContractState::Fetching);
        assert!(group.fetch_deadline.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_chain_times_out_the_fetch_and_the_next_tx_retries() {
        let mut h = harness().await;
        let (group, handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());
        let metrics = h.ctx.metrics.clone();
        tokio::spawn(group.start());

        handle.tx_tx.send(tx("tx-1", 0)).await.unwrap();
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::GetContractReq { tx_id, .. } => assert_eq!(tx_id, "tx-1"),
            other => panic!("unexpected event: {:?}", other),
        }

        // The chain never answers; the deadline fires and the buffered tx
        // comes back as a get-bytecode error.
        let msg = h.sched_event_rx.recv().await.unwrap();
        assert_eq!(msg.msg_type(), MsgType::Error);
        assert_eq!(msg.tx_id, "tx-1");
        assert_eq!(msg.error.unwrap().code, 4);
        assert_eq!(metrics.bytecode_failures_total.get(), 1);

        // The next tx finds the group empty again and restarts the cycle.
        handle.tx_tx.send(tx("tx-2", 0)).await.unwrap();
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::GetContractReq { tx_id, .. } => assert_eq!(tx_id, "tx-2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn teardown_drains_queues_with_group_exited() {
        let mut h = harness().await;
        let (mut group, handle) = RequestGroup::new(h.ctx.clone(), test_key(), h.managers.clone());
        group.handle_event(GroupEvent::ContractReady { ok: true }).await;
        group.handle_tx(tx("tx-1", 0)).await;
        group.handle_tx(tx("tx-2", 1)).await;
        assert_eq!(handle.orig_queue.len() + handle.cross_queue.len(), 2);

        group.drain_exit().await;

        for _ in 0..2 {
            let msg = h.sched_event_rx.recv().await.unwrap();
            assert_eq!(msg.error.unwrap().code, 7); // group exited
        }
        assert!(handle.orig_queue.is_empty());
        assert!(handle.cross_queue.is_empty());
    }
}
