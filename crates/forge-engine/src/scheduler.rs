// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - REQUEST SCHEDULER
//
// Single entry point for tx traffic. Enforces the call-depth ceiling,
// owns the Request Group registry, and merges outbound events (errors,
// responses raised by components) onto the chain stream.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::process_manager::ManagerPair;
use crate::request_group::RequestGroup;
use crate::types::{now_nanos, EngineContext, PendingTx};
use forge_protocol::{
    error_msg, ContractKey, EngineError, StepDuration, TxMessage, CALL_CONTRACT_DEPTH,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Scheduler {
    ctx: Arc<EngineContext>,
    managers: ManagerPair,
    event_rx: mpsc::Receiver<TxMessage>,
    tx_rx: mpsc::Receiver<PendingTx>,
    close_rx: mpsc::Receiver<ContractKey>,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<EngineContext>,
        managers: ManagerPair,
        event_rx: mpsc::Receiver<TxMessage>,
        tx_rx: mpsc::Receiver<PendingTx>,
        close_rx: mpsc::Receiver<ContractKey>,
    ) -> Self {
        Self {
            ctx,
            managers,
            event_rx,
            tx_rx,
            close_rx,
        }
    }

    pub async fn start(mut self) {
        println!("⚙️ [SCHEDULER] started");
        loop {
            tokio::select! {
                tx = self.tx_rx.recv() => match tx {
                    Some(tx) => self.route_tx(tx).await,
                    None => break,
                },
                msg = self.event_rx.recv() => match msg {
                    Some(msg) => {
                        if self.ctx.chain_tx.send(msg).await.is_err() {
                            eprintln!("❌ [SCHEDULER] chain channel closed");
                        }
                    }
                    None => break,
                },
                key = self.close_rx.recv() => match key {
                    Some(key) => self.close_group(&key).await,
                    None => break,
                },
            }
        }
        println!("⚙️ [SCHEDULER] stopped");
    }

    async fn route_tx(&mut self, mut tx: PendingTx) {
        let Some(key) = tx.msg.contract_key() else {
            eprintln!("⚠️ [SCHEDULER] tx {} has no contract id, dropped", tx.tx_id());
            return;
        };

        let depth = tx.msg.current_depth();
        if depth > CALL_CONTRACT_DEPTH {
            self.ctx.metrics.depth_rejections_total.inc();
            let err = EngineError::DepthExceeded(CALL_CONTRACT_DEPTH);
            println!("⚠️ [SCHEDULER] tx {} rejected: {}", tx.tx_id(), err);
            if self
                .ctx
                .chain_tx
                .send(error_msg(&tx.msg.chain_id, tx.tx_id(), &err))
                .await
                .is_err()
            {
                eprintln!("❌ [SCHEDULER] chain channel closed");
            }
            return;
        }

        if !self.ctx.cfg.disable_slow_log {
            tx.msg.step_durations.push(StepDuration {
                step: "scheduler-in".to_string(),
                start_unix_nanos: now_nanos(),
                duration_nanos: tx.age().as_nanos() as i64,
            });
        }

        let canonical = key.canonical();
        let group = match self.ctx.scheduler.get_group(&canonical) {
            Some(group) => group,
            None => self.create_group(key),
        };
        if group.tx_tx.send(tx).await.is_err() {
            // Group closed underneath us; the chain retries the tx.
            eprintln!("⚠️ [SCHEDULER] group {} gone, tx dropped", canonical);
        }
    }

    fn create_group(&self, key: ContractKey) -> crate::types::GroupHandle {
        let canonical = key.canonical();
        let (group, handle) =
            RequestGroup::new(self.ctx.clone(), key, self.managers.clone());
        let count = match self.ctx.scheduler.groups.write() {
            Ok(mut map) => {
                map.insert(canonical.clone(), handle.clone());
                map.len()
            }
            Err(poisoned) => {
                let mut map = poisoned.into_inner();
                map.insert(canonical.clone(), handle.clone());
                map.len()
            }
        };
        self.ctx.metrics.request_groups.set(count as i64);
        tokio::spawn(group.start());
        handle
    }

    async fn close_group(&mut self, key: &ContractKey) {
        let canonical = key.canonical();
        let removed = match self.ctx.scheduler.groups.write() {
            Ok(mut map) => {
                let removed = map.remove(&canonical);
                self.ctx.metrics.request_groups.set(map.len() as i64);
                removed
            }
            Err(poisoned) => {
                let mut map = poisoned.into_inner();
                let removed = map.remove(&canonical);
                self.ctx.metrics.request_groups.set(map.len() as i64);
                removed
            }
        };
        match removed {
            Some(handle) => {
                println!("⚙️ [SCHEDULER] closing group {}", canonical);
                let _ = handle.stop_tx.send(()).await;
            }
            None => println!("⚙️ [SCHEDULER] close for unknown group {}", canonical),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::metrics::EngineMetrics;
    use crate::process_manager::ProcessManager;
    use crate::types::{ContractEvent, SchedulerHandle};
    use crate::users::UserManager;
    use forge_protocol::{proto, MsgType};
    use std::collections::HashMap;
    use std::sync::RwLock;
    use std::time::Duration;

    struct Harness {
        scheduler: Scheduler,
        handle: SchedulerHandle,
        chain_rx: mpsc::Receiver<TxMessage>,
        contract_rx: mpsc::Receiver<ContractEvent>,
        _tmp: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Arc::new(EngineConfig {
            max_original_process_num: 2,
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
        let handle = SchedulerHandle {
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
            scheduler: handle.clone(),
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

        let scheduler = Scheduler::new(
            ctx,
            managers,
            sched_event_rx,
            sched_tx_rx,
            sched_close_rx,
        );
        Harness {
            scheduler,
            handle,
            chain_rx,
            contract_rx,
            _tmp: tmp,
        }
    }

    fn tx_for(name: &str, id: &str, depth: u32) -> PendingTx {
        PendingTx::new(TxMessage {
            r#type: MsgType::TxRequest as i32,
            chain_id: "c1".to_string(),
            tx_id: id.to_string(),
            cross_context: (depth > 0).then(|| proto::CrossContext {
                process_name: String::new(),
                current_depth: depth,
            }),
            request: Some(proto::TxRequest {
                contract: Some(ContractKey::new("c1", name, "1.0.0", 0).to_contract_id()),
                method: "save".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn first_tx_creates_the_group_and_starts_a_fetch() {
        let mut h = harness().await;
        h.scheduler.route_tx(tx_for("counter", "tx-1", 0)).await;

        assert!(h.handle.get_group("c1#counter#1.0.0#0").is_some());
        assert_eq!(h.scheduler.ctx.metrics.request_groups.get(), 1);

        // The spawned group worker asks the Contract Manager for bytecode.
        match h.contract_rx.recv().await.unwrap() {
            ContractEvent::GetContractReq { key, tx_id } => {
                assert_eq!(key.contract_name, "counter");
                assert_eq!(tx_id, "tx-1");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Same contract again: no second group.
        h.scheduler.route_tx(tx_for("counter", "tx-2", 0)).await;
        assert_eq!(h.scheduler.ctx.metrics.request_groups.get(), 1);
    }

    #[tokio::test]
    async fn distinct_versions_get_distinct_groups() {
        let mut h = harness().await;
        h.scheduler.route_tx(tx_for("counter", "tx-1", 0)).await;
        let mut v2 = tx_for("counter", "tx-2", 0);
        if let Some(req) = v2.msg.request.as_mut() {
            if let Some(c) = req.contract.as_mut() {
                c.contract_version = "2.0.0".to_string();
            }
        }
        h.scheduler.route_tx(v2).await;
        assert_eq!(h.scheduler.ctx.metrics.request_groups.get(), 2);
    }

    #[tokio::test]
    async fn depth_over_the_ceiling_is_rejected_synchronously() {
        let mut h = harness().await;
        h.scheduler.route_tx(tx_for("counter", "tx-deep", 6)).await;

        let msg = h.chain_rx.recv().await.unwrap();
        assert_eq!(msg.msg_type(), MsgType::Error);
        assert_eq!(msg.tx_id, "tx-deep");
        let payload = msg.error.unwrap();
        assert_eq!(payload.code, 1);
        assert_eq!(payload.message, "current depth exceed 5");
        // No group was created for it.
        assert_eq!(h.scheduler.ctx.metrics.request_groups.get(), 0);
        assert_eq!(h.scheduler.ctx.metrics.depth_rejections_total.get(), 1);
    }

    #[tokio::test]
    async fn depth_at_the_ceiling_is_still_routed() {
        let mut h = harness().await;
        h.scheduler.route_tx(tx_for("counter", "tx-5", 5)).await;
        assert_eq!(h.scheduler.ctx.metrics.request_groups.get(), 1);
        assert!(h.chain_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_removes_the_group_and_drains_it() {
        let mut h = harness().await;
        h.scheduler.route_tx(tx_for("counter", "tx-1", 0)).await;
        let key = ContractKey::new("c1", "counter", "1.0.0", 0);
        assert!(h.handle.get_group(&key.canonical()).is_some());

        h.scheduler.close_group(&key).await;
        assert!(h.handle.get_group(&key.canonical()).is_none());
        assert_eq!(h.scheduler.ctx.metrics.request_groups.get(), 0);

        // The group worker drains asynchronously: the buffered tx-1 comes
        // back as a group-exited error on the scheduler's event channel.
        let msg = tokio::time::timeout(Duration::from_secs(5), h.scheduler.event_rx.recv())
            .await
            .expect("drain within deadline")
            .expect("drained tx error");
        assert_eq!(msg.error.unwrap().code, 7);
    }
}
