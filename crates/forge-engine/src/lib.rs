// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - CONTRACT EXECUTION ENGINE
//
// Coordination core between a chain node and sandboxed contract processes:
// - Request Scheduler + per-contract Request Groups (routing)
// - Two Process Managers (original / cross pools) over one user pool
// - Contract Manager (on-disk binary LRU)
// - Chain RPC + Sandbox RPC duplex stream services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod chain_service;
pub mod config;
pub mod contracts;
pub mod metrics;
pub mod process;
pub mod process_manager;
pub mod request_group;
pub mod sandbox_service;
pub mod scheduler;
pub mod types;
pub mod users;

pub use config::{EngineConfig, Transport};
pub use metrics::EngineMetrics;

use crate::config::CHAIN_EVENT_CH_SIZE;
use crate::contracts::ContractManager;
use crate::process_manager::{ManagerPair, ProcessManager};
use crate::scheduler::Scheduler;
use crate::types::{EngineContext, SchedulerHandle};
use crate::users::UserManager;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// The running engine. Construction wires every component channel-first,
/// then spawns the workers, then binds the two RPC servers; nothing
/// observes a half-wired engine.
pub struct SandboxEngine {
    ctx: Arc<EngineContext>,
    managers: ManagerPair,
}

impl SandboxEngine {
    pub async fn start(cfg: EngineConfig) -> Result<Self, String> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);

        for dir in [
            std::path::PathBuf::from(&cfg.sock_dir),
            std::path::PathBuf::from(&cfg.log_dir),
            cfg.contract_bins_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| format!("create {}: {}", dir.display(), e))?;
        }

        let metrics = Arc::new(EngineMetrics::new()?);
        let users = Arc::new(UserManager::new(cfg.clone(), metrics.clone()));
        users.batch_create_users().await?;

        // Channels first, workers second.
        let (sched_event_tx, sched_event_rx) = mpsc::channel(CHAIN_EVENT_CH_SIZE);
        let (sched_tx_tx, sched_tx_rx) = mpsc::channel(CHAIN_EVENT_CH_SIZE);
        let (sched_close_tx, sched_close_rx) = mpsc::channel(64);
        let scheduler_handle = SchedulerHandle {
            event_tx: sched_event_tx,
            tx_tx: sched_tx_tx,
            close_tx: sched_close_tx,
            groups: Arc::new(RwLock::new(HashMap::new())),
        };
        let (chain_tx, chain_rx) = mpsc::channel(CHAIN_EVENT_CH_SIZE);
        let (contract_tx, contract_rx) = mpsc::channel(CHAIN_EVENT_CH_SIZE);

        let ctx = Arc::new(EngineContext {
            cfg: cfg.clone(),
            metrics,
            users,
            scheduler: scheduler_handle,
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

        tokio::spawn(ContractManager::new(ctx.clone(), contract_rx).start());
        tokio::spawn(
            Scheduler::new(
                ctx.clone(),
                managers.clone(),
                sched_event_rx,
                sched_tx_rx,
                sched_close_rx,
            )
            .start(),
        );

        {
            let cfg = cfg.clone();
            let managers = managers.clone();
            tokio::spawn(async move {
                if let Err(e) = sandbox_service::serve_sandbox_rpc(cfg, managers).await {
                    eprintln!("❌ [ENGINE] sandbox rpc died: {}", e);
                }
            });
        }
        {
            let cfg = cfg.clone();
            let ctx = ctx.clone();
            let managers = managers.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    chain_service::serve_chain_rpc(cfg, ctx, managers, chain_rx).await
                {
                    eprintln!("❌ [ENGINE] chain rpc died: {}", e);
                }
            });
        }

        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("🚀 FORGE ENGINE STARTED");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("   Transport: {:?}", cfg.transport);
        println!(
            "   Pools: {} orig / {} cross",
            cfg.max_original_process_num,
            cfg.max_cross_process_num()
        );
        println!("   Contract cache: {} slots", cfg.contract_lru_cap());
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        Ok(Self { ctx, managers })
    }

    pub fn metrics_text(&self) -> String {
        self.ctx.metrics.gather()
    }

    /// One-screen state summary, printed on SIGINT and on demand.
    pub fn diagnostic_dump(&self) -> String {
        let groups = match self.ctx.scheduler.groups.read() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        format!(
            "groups={} orig={{live={} idle={}}} cross={{live={} idle={}}}",
            groups,
            self.managers.orig.live_processes(),
            self.managers.orig.idle_processes(),
            self.managers.cross.live_processes(),
            self.managers.cross.idle_processes(),
        )
    }

    /// Graceful stop: close idle sandboxes, then destroy the user pool.
    /// Busy sandboxes finish their tx or die with the engine process.
    pub async fn shutdown(&self) {
        println!("🛑 [ENGINE] shutting down: {}", self.diagnostic_dump());
        self.managers.orig.close_all_idle().await;
        self.managers.cross.close_all_idle().await;
        self.ctx.users.release_users().await;
        println!("✅ [ENGINE] shutdown complete");
    }
}
