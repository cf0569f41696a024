// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - PROCESS MANAGER
//
// One instance per depth class (original / cross), each with its own cap.
// - Allocation in three phases: fresh launch, idle takeover, waiting list
// - Oldest idle processes are migrated or released first
// - Periodic release keeps a configurable share of the pool free
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::metrics::EngineMetrics;
use crate::process::Process;
use crate::types::{safe_lock, EngineContext, GroupEvent, ManagerEvent};
use forge_protocol::{ContractKey, KEY_SEPARATOR};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct ManagerInner {
    /// Every live process, by name. Membership bounds the pool.
    processes: HashMap<String, Arc<Process>>,
    /// Idle subset, with hand-out order. `idle_order` may hold stale names;
    /// they are skipped on pop.
    idle: HashMap<String, Arc<Process>>,
    idle_order: VecDeque<String>,
    /// Canonical contract key -> names of processes bound to it.
    groups: HashMap<String, HashSet<String>>,
    /// Allocation requests that found no slot: canonical key -> remaining
    /// need, drained FIFO when capacity appears.
    waiting: HashMap<String, (ContractKey, usize)>,
    waiting_order: VecDeque<String>,
}

impl ManagerInner {
    fn pop_oldest_idle(&mut self) -> Option<Arc<Process>> {
        while let Some(name) = self.idle_order.pop_front() {
            if let Some(p) = self.idle.remove(&name) {
                return Some(p);
            }
        }
        None
    }

    fn unbind(&mut self, canonical: &str, name: &str) {
        if let Some(set) = self.groups.get_mut(canonical) {
            set.remove(name);
            if set.is_empty() {
                self.groups.remove(canonical);
            }
        }
    }
}

/// The shareable face of a manager: what processes, groups and the RPC
/// services need. The allocation logic itself lives on the worker.
#[derive(Clone)]
pub struct ManagerHandle {
    pub event_tx: mpsc::Sender<ManagerEvent>,
    is_orig: bool,
    inner: Arc<Mutex<ManagerInner>>,
    metrics: Arc<EngineMetrics>,
}

impl ManagerHandle {
    /// Move a process between the idle collection and busy accounting.
    /// `to_busy` fails when the process is not currently idle (it lost a
    /// race with a migration or close); the caller must not serve.
    pub fn change_process_state(&self, name: &str, to_busy: bool) -> Result<(), String> {
        let mut inner = safe_lock(&self.inner);
        if to_busy {
            if inner.idle.remove(name).is_none() {
                return Err(format!("process {} is not idle", name));
            }
        } else {
            let Some(p) = inner.processes.get(name).cloned() else {
                return Err(format!("process {} is not managed", name));
            };
            inner.idle.insert(name.to_string(), p);
            inner.idle_order.push_back(name.to_string());
            if !inner.waiting_order.is_empty() {
                let _ = self.event_tx.try_send(ManagerEvent::AllocateIdle);
            }
        }
        self.sync_gauges(&inner);
        Ok(())
    }

    pub fn get_process(&self, name: &str) -> Option<Arc<Process>> {
        safe_lock(&self.inner).processes.get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, name: &str, process: Arc<Process>) {
        let mut inner = safe_lock(&self.inner);
        inner.processes.insert(name.to_string(), process.clone());
        inner
            .groups
            .entry(process.key().canonical())
            .or_default()
            .insert(name.to_string());
    }

    /// (bound, executing) for one contract; the group's need computation.
    pub fn contract_stats(&self, canonical: &str) -> (usize, usize) {
        let inner = safe_lock(&self.inner);
        let Some(set) = inner.groups.get(canonical) else {
            return (0, 0);
        };
        let executing = set
            .iter()
            .filter_map(|name| inner.processes.get(name))
            .filter(|p| p.is_executing())
            .count();
        (set.len(), executing)
    }

    pub fn live_processes(&self) -> usize {
        safe_lock(&self.inner).processes.len()
    }

    pub fn idle_processes(&self) -> usize {
        safe_lock(&self.inner).idle.len()
    }

    /// Shutdown: close every idle process and let busy ones finish their tx.
    pub async fn close_all_idle(&self) {
        let victims = {
            let mut inner = safe_lock(&self.inner);
            let mut victims = Vec::new();
            while let Some(p) = inner.pop_oldest_idle() {
                inner.unbind(&p.key().canonical(), &p.name());
                victims.push(p);
            }
            self.sync_gauges(&inner);
            victims
        };
        for process in victims {
            let _ = process.close_sandbox().await;
        }
    }

    fn sync_gauges(&self, inner: &ManagerInner) {
        let idle = inner.idle.len() as i64;
        let busy = inner.processes.len() as i64 - idle;
        if self.is_orig {
            self.metrics.orig_idle_processes.set(idle);
            self.metrics.orig_busy_processes.set(busy);
        } else {
            self.metrics.cross_idle_processes.set(idle);
            self.metrics.cross_busy_processes.set(busy);
        }
    }
}

/// Both pools together; what the router-side components hold.
#[derive(Clone)]
pub struct ManagerPair {
    pub orig: ManagerHandle,
    pub cross: ManagerHandle,
}

impl ManagerPair {
    pub fn side(&self, is_orig: bool) -> &ManagerHandle {
        if is_orig {
            &self.orig
        } else {
            &self.cross
        }
    }

    /// Resolve a process by name. The trailing name segment says which pool
    /// owns it; unknown suffixes fall through to both.
    pub fn find_process(&self, name: &str) -> Option<Arc<Process>> {
        if name.ends_with("#orig") {
            self.orig.get_process(name)
        } else if name.ends_with("#cross") {
            self.cross.get_process(name)
        } else {
            self.orig
                .get_process(name)
                .or_else(|| self.cross.get_process(name))
        }
    }
}

pub struct ProcessManager {
    ctx: Arc<EngineContext>,
    is_orig: bool,
    cap: usize,
    inner: Arc<Mutex<ManagerInner>>,
    /// Per-pool assignment sequence; the second-to-last name segment.
    seq: AtomicU64,
    event_tx: mpsc::Sender<ManagerEvent>,
    event_rx: mpsc::Receiver<ManagerEvent>,
}

impl ProcessManager {
    pub fn new(ctx: Arc<EngineContext>, is_orig: bool) -> Self {
        let cap = if is_orig {
            ctx.cfg.max_original_process_num
        } else {
            ctx.cfg.max_cross_process_num()
        };
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            ctx,
            is_orig,
            cap,
            inner: Arc::new(Mutex::new(ManagerInner::default())),
            seq: AtomicU64::new(0),
            event_tx,
            event_rx,
        }
    }

    #[cfg(test)]
    pub(crate) fn into_event_rx(self) -> mpsc::Receiver<ManagerEvent> {
        self.event_rx
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            event_tx: self.event_tx.clone(),
            is_orig: self.is_orig,
            inner: self.inner.clone(),
            metrics: self.ctx.metrics.clone(),
        }
    }

    pub async fn start(mut self) {
        let side = if self.is_orig { "orig" } else { "cross" };
        println!("⚙️ [MANAGER:{}] started, pool cap {}", side, self.cap);
        let period = self.ctx.cfg.release_period();
        let mut release =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        release.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                ev = self.event_rx.recv() => match ev {
                    Some(ManagerEvent::GetProcessReq { key, need }) => {
                        self.allocate(&key, need).await;
                    }
                    Some(ManagerEvent::SandboxExit { process_name }) => {
                        self.handle_exit(&process_name).await;
                    }
                    Some(ManagerEvent::AllocateIdle) | Some(ManagerEvent::AllocateNew) => {
                        self.drain_waiting().await;
                    }
                    None => break,
                },
                _ = release.tick() => self.periodic_release().await,
            }
        }
        println!("⚙️ [MANAGER:{}] stopped", side);
    }

    /// `{canonical}#{bound}#{seq}#{orig|cross}`: the bound count says how
    /// many processes the contract already had at assignment; the pool's
    /// sequence makes every sandbox life distinct, so a respawned or
    /// migrated process is never confused with its predecessor's stream.
    fn next_process_name(&self, canonical: &str) -> String {
        let bound = safe_lock(&self.inner)
            .groups
            .get(canonical)
            .map_or(0, |set| set.len());
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let side = if self.is_orig { "orig" } else { "cross" };
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            canonical,
            bound,
            seq,
            side,
            sep = KEY_SEPARATOR
        )
    }

    /// Satisfy `need` processes for `key`: fresh launches while the pool has
    /// room, then takeover of the oldest idle processes, then the waiting
    /// list. Idle processes already bound to `key` count toward `need`
    /// without a migration.
    async fn allocate(&self, key: &ContractKey, need: usize) {
        let canonical = key.canonical();
        let Some(group) = self.ctx.scheduler.get_group(&canonical) else {
            // Group dissolved between request and service.
            return;
        };
        let handle = self.handle();
        let mut allocated = 0usize;
        let mut satisfied = 0usize;

        // Phase 1: fresh launches.
        while satisfied < need {
            let has_room = safe_lock(&self.inner).processes.len() < self.cap;
            if !has_room {
                break;
            }
            let Some(user) = self.ctx.users.get_available_user().await else {
                break;
            };
            let name = self.next_process_name(&canonical);
            let process = Process::new(
                self.ctx.clone(),
                handle.clone(),
                user,
                key.clone(),
                name.clone(),
                group.clone(),
                self.is_orig,
            );
            {
                let mut inner = safe_lock(&self.inner);
                inner.processes.insert(name.clone(), process.clone());
                inner
                    .groups
                    .entry(canonical.clone())
                    .or_default()
                    .insert(name.clone());
            }
            tokio::spawn(process.start());
            allocated += 1;
            satisfied += 1;
        }

        // Phase 2: idle takeover, oldest first. Same-contract idles are kept
        // in place (they will drain the queue themselves).
        let mut kept_same_key = Vec::new();
        while satisfied < need {
            let candidate = safe_lock(&self.inner).pop_oldest_idle();
            let Some(process) = candidate else { break };
            let old_key = process.key();
            let old_name = process.name();
            if old_key.canonical() == canonical {
                kept_same_key.push((old_name, process));
                satisfied += 1;
                continue;
            }
            let new_name = self.next_process_name(&canonical);
            match process
                .change_sandbox(key.clone(), new_name.clone(), group.clone())
                .await
            {
                Ok(()) => {
                    let mut inner = safe_lock(&self.inner);
                    inner.processes.remove(&old_name);
                    inner.unbind(&old_key.canonical(), &old_name);
                    inner.processes.insert(new_name.clone(), process.clone());
                    inner
                        .groups
                        .entry(canonical.clone())
                        .or_default()
                        .insert(new_name.clone());
                    self.ctx.metrics.processes_migrated_total.inc();
                    allocated += 1;
                    satisfied += 1;
                }
                Err(_) => {
                    // Exited between pop and takeover; its exit event will
                    // reclaim the slot.
                }
            }
        }
        {
            let mut inner = safe_lock(&self.inner);
            // Reinsert in their original age order, ahead of younger idles.
            for (name, process) in kept_same_key.into_iter().rev() {
                inner.idle.insert(name.clone(), process);
                inner.idle_order.push_front(name);
            }

            // Phase 3: park the remainder.
            if satisfied < need {
                let remaining = need - satisfied;
                match inner.waiting.get_mut(&canonical) {
                    Some((_, pending)) => *pending = (*pending).max(remaining),
                    None => {
                        inner
                            .waiting
                            .insert(canonical.clone(), (key.clone(), remaining));
                        inner.waiting_order.push_back(canonical.clone());
                    }
                }
            }
            handle.sync_gauges(&inner);
        }

        if group
            .event_tx
            .send(GroupEvent::ProcessReady {
                is_orig: self.is_orig,
                allocated,
            })
            .await
            .is_err()
        {
            eprintln!("⚠️ [MANAGER] group {} closed before ProcessReady", canonical);
        }
    }

    async fn handle_exit(&self, name: &str) {
        let removed = {
            let mut inner = safe_lock(&self.inner);
            let process = inner.processes.remove(name);
            if let Some(p) = &process {
                inner.idle.remove(name);
                inner.unbind(&p.key().canonical(), name);
                self.handle().sync_gauges(&inner);
            }
            process
        };
        let Some(process) = removed else {
            // Already unbound by close or migration bookkeeping.
            return;
        };
        self.ctx.users.free_user(process.user()).await;
        self.drain_waiting().await;
    }

    async fn drain_waiting(&self) {
        let parked: Vec<(ContractKey, usize)> = {
            let mut inner = safe_lock(&self.inner);
            let order: Vec<String> = inner.waiting_order.drain(..).collect();
            order
                .into_iter()
                .filter_map(|canonical| inner.waiting.remove(&canonical))
                .collect()
        };
        for (key, need) in parked {
            // Re-parks internally when there is still no capacity.
            self.allocate(&key, need).await;
        }
    }

    /// Close the oldest idle processes until `release_rate_pct` of the pool
    /// is free. Closed processes stay in `processes` (still counted against
    /// the cap) until their exit lands.
    async fn periodic_release(&self) {
        let target_free = self.cap * self.ctx.cfg.release_rate_pct as usize / 100;
        let victims = {
            let mut inner = safe_lock(&self.inner);
            let current_free = self.cap.saturating_sub(inner.processes.len());
            let mut to_close = target_free.saturating_sub(current_free);
            let mut victims = Vec::new();
            while to_close > 0 {
                let Some(process) = inner.pop_oldest_idle() else { break };
                inner.unbind(&process.key().canonical(), &process.name());
                victims.push(process);
                to_close -= 1;
            }
            self.handle().sync_gauges(&inner);
            victims
        };
        if victims.is_empty() {
            return;
        }
        let side = if self.is_orig { "orig" } else { "cross" };
        println!("🧹 [MANAGER:{}] releasing {} idle processes", side, victims.len());
        for process in victims {
            match process.close_sandbox().await {
                Ok(()) => self.ctx.metrics.processes_closed_total.inc(),
                Err(e) => eprintln!("⚠️ [MANAGER:{}] release skipped: {}", side, e),
            }
        }
    }

}
