// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - SHARED PLUMBING
//
// Channel-crossing types used by every component:
// - PendingTx: a tx request plus its engine-side bookkeeping
// - TxQueue: multi-consumer FIFO drained by sandbox processes
// - Handles: the capability subset each component exposes to its peers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::users::UserManager;
use forge_protocol::{ContractKey, TxMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Safe mutex lock that recovers from poisoned state instead of panicking.
/// When a task panics while holding a lock, the Mutex becomes "poisoned".
/// Instead of cascading panics, we recover the inner data.
pub fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            eprintln!("⚠️ WARNING: Mutex was poisoned, recovering...");
            poisoned.into_inner()
        }
    }
}

/// Nanosecond wall-clock stamp. Used for the contract file version fence.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// A tx request travelling through the engine. `enqueued_at` is stamped when
/// the chain stream first hands the tx to the Scheduler and survives
/// requeues, so the age caps measure true time-in-engine.
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub msg: TxMessage,
    pub enqueued_at: Instant,
    /// Contract file version the owning group had when this tx was routed.
    /// Fences stale bad-contract reports.
    pub cfv: i64,
}

impl PendingTx {
    pub fn new(msg: TxMessage) -> Self {
        Self {
            msg,
            enqueued_at: Instant::now(),
            cfv: 0,
        }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn tx_id(&self) -> &str {
        &self.msg.tx_id
    }
}

/// FIFO of txs for one depth class of one Request Group. The group pushes;
/// every process allocated to the group pulls. Multi-consumer semantics come
/// from serializing receivers through an async mutex; tokio's mpsc recv is
/// cancel-safe, so a consumer dropped mid-wait loses nothing.
#[derive(Clone)]
pub struct TxQueue {
    tx: mpsc::Sender<PendingTx>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingTx>>>,
    depth: Arc<AtomicUsize>,
}

impl TxQueue {
    pub fn new(cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(cap);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn push(&self, tx: PendingTx) -> Result<(), String> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(tx).await.map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            "tx queue closed".to_string()
        })
    }

    pub async fn pop(&self) -> Option<PendingTx> {
        let mut rx = self.rx.lock().await;
        let tx = rx.recv().await;
        if tx.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        tx
    }

    pub fn try_pop(&self) -> Option<PendingTx> {
        let mut rx = match self.rx.try_lock() {
            Ok(rx) => rx,
            Err(_) => return None,
        };
        match rx.try_recv() {
            Ok(tx) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Some(tx)
            }
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events delivered to a Request Group worker.
#[derive(Debug)]
pub enum GroupEvent {
    /// Contract Manager: bytecode is (not) on disk and ready to spawn from.
    ContractReady { ok: bool },
    /// Process Manager: an earlier GetProcessReq completed; `allocated` is
    /// the number of processes actually launched or migrated (same-contract
    /// matches contribute 0).
    ProcessReady { is_orig: bool, allocated: usize },
    /// A sandbox reported its binary as corrupt or unloadable.
    BadContract { tx_id: String, cfv: i64 },
}

/// Capability handle to one Request Group.
#[derive(Clone)]
pub struct GroupHandle {
    pub key: ContractKey,
    pub event_tx: mpsc::Sender<GroupEvent>,
    pub tx_tx: mpsc::Sender<PendingTx>,
    pub stop_tx: mpsc::Sender<()>,
    pub orig_queue: TxQueue,
    pub cross_queue: TxQueue,
}

impl GroupHandle {
    pub fn queue(&self, is_orig: bool) -> &TxQueue {
        if is_orig {
            &self.orig_queue
        } else {
            &self.cross_queue
        }
    }
}

/// Shared lookup table of live Request Groups, keyed by canonical contract
/// key. The Scheduler is the sole writer.
pub type GroupRegistry = Arc<RwLock<HashMap<String, GroupHandle>>>;

pub fn lookup_group(registry: &GroupRegistry, canonical: &str) -> Option<GroupHandle> {
    match registry.read() {
        Ok(map) => map.get(canonical).cloned(),
        Err(poisoned) => poisoned.into_inner().get(canonical).cloned(),
    }
}

/// Capability handle to the Request Scheduler: the three input channels plus
/// group lookup.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub event_tx: mpsc::Sender<TxMessage>,
    pub tx_tx: mpsc::Sender<PendingTx>,
    pub close_tx: mpsc::Sender<ContractKey>,
    pub groups: GroupRegistry,
}

impl SchedulerHandle {
    pub fn get_group(&self, canonical: &str) -> Option<GroupHandle> {
        lookup_group(&self.groups, canonical)
    }

    pub async fn put_event(&self, msg: TxMessage) {
        if self.event_tx.send(msg).await.is_err() {
            eprintln!("❌ [SCHEDULER] event channel closed");
        }
    }

    pub async fn put_tx(&self, tx: PendingTx) {
        if self.tx_tx.send(tx).await.is_err() {
            eprintln!("❌ [SCHEDULER] tx channel closed");
        }
    }
}

/// Events delivered to the Contract Manager worker.
#[derive(Debug)]
pub enum ContractEvent {
    /// A group needs the binary for `key`; `tx_id` names the tx that is
    /// blocked on it (echoed to the chain for correlation).
    GetContractReq { key: ContractKey, tx_id: String },
    /// GET_BYTECODE_RESPONSE from the chain.
    GetContractResp { msg: TxMessage },
    /// Evict `key`: a running sandbox condemned the binary. The group has
    /// already fenced the report against its contract file version.
    BadContract { key: ContractKey },
}

/// Events delivered to a Process Manager worker.
#[derive(Debug)]
pub enum ManagerEvent {
    /// A group wants `need` more processes bound to `key`.
    GetProcessReq { key: ContractKey, need: usize },
    /// A Process finished handling its sandbox's exit.
    SandboxExit { process_name: String },
    /// A process went idle while groups were waiting; drain the waiting
    /// list against the idle collection.
    AllocateIdle,
    /// A slot opened (busy process exited or cleanup ran); drain the
    /// waiting list against fresh launches.
    AllocateNew,
}

/// Everything long-lived that components share. Built once at startup,
/// before any worker is spawned, so no component ever sees a half-wired
/// engine.
pub struct EngineContext {
    pub cfg: Arc<EngineConfig>,
    pub metrics: Arc<EngineMetrics>,
    pub users: Arc<UserManager>,
    pub scheduler: SchedulerHandle,
    /// Engine -> chain send channel (drained by the Chain RPC send worker).
    pub chain_tx: mpsc::Sender<TxMessage>,
    pub contract_tx: mpsc::Sender<ContractEvent>,
}
