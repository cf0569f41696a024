// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - SANDBOX PROCESS
//
// One record per sandbox OS process.
// - Spawns the contract binary under a dedicated uid in a fresh PID namespace
// - Serves txs strictly one at a time over the sandbox stream
// - Per-tx execution deadline with SIGINT + SIGKILL escalation
// - Migrated between contracts by the Process Manager while idle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::process_manager::ManagerHandle;
use crate::types::{safe_lock, EngineContext, GroupEvent, GroupHandle, ManagerEvent, PendingTx, TxQueue};
use forge_protocol::{error_msg, ContractKey, CrossContext, EngineError, MsgType, RespCode, StepDuration, TxMessage};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Notify};

/// Grace between the diagnostic SIGINT and the SIGKILL when a tx deadline
/// fires.
pub const SIGKILL_GRACE: Duration = Duration::from_millis(200);

/// Backoff before respawning a sandbox that died during startup.
const RESPAWN_DELAY: Duration = Duration::from_millis(200);

/// Cap on buffered sandbox stderr kept for the failure reason.
const STDERR_CAP: usize = 4096;

/// Executions slower than this are logged when slow logging is on.
const SLOW_TX_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawning or respawning; the manager counts this as busy.
    Created,
    /// Stream up, waiting for a tx.
    Ready,
    /// Executing a tx.
    Busy,
    /// Stream up, no tx, parked in the manager's idle collection.
    Idle,
    /// Sandbox being killed to migrate to a new contract.
    Changing,
    /// Sandbox being killed by periodic cleanup.
    Closing,
    /// Tx deadline fired; sandbox being killed.
    Timeout,
    /// Exit fully handled; the worker is gone.
    Dead,
}

#[derive(Debug)]
pub enum ProcessEvent {
    /// A message from this process's sandbox stream.
    SandboxMsg(TxMessage),
    /// The sandbox opened its stream and sent REGISTER.
    Registered,
    /// The sandbox OS process exited.
    Exit(ExitInfo),
}

#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// How old a tx is at pickup, against the two age caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAge {
    Fresh,
    /// Past the execution deadline already; terminal error.
    Expired,
    /// Past the removal cap; dropped silently, the chain retries.
    Stale,
}

pub fn classify_age(age: Duration, exec_timeout: Duration, remove_time: Duration) -> TxAge {
    if age > remove_time {
        TxAge::Stale
    } else if age > exec_timeout {
        TxAge::Expired
    } else {
        TxAge::Fresh
    }
}

pub struct Process {
    ctx: Arc<EngineContext>,
    manager: ManagerHandle,
    is_orig: bool,
    user: crate::users::SandboxUser,

    // Contract identity; rewritten in place on migration.
    name: Mutex<String>,
    key: Mutex<ContractKey>,
    group: Mutex<GroupHandle>,

    state: Mutex<ProcessState>,
    current_tx: Mutex<Option<PendingTx>>,
    exec_started: Mutex<Option<Instant>>,
    stderr_buf: Arc<Mutex<String>>,

    stream_tx: Mutex<Option<mpsc::Sender<TxMessage>>>,
    event_tx: mpsc::Sender<ProcessEvent>,
    event_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ProcessEvent>>>,

    pid: AtomicI32,
    // Spawn-ready gate: kills wait for the pid to exist.
    spawned_tx: watch::Sender<bool>,
    spawned_rx: watch::Receiver<bool>,
    wake: Notify,
}

impl Process {
    pub fn new(
        ctx: Arc<EngineContext>,
        manager: ManagerHandle,
        user: crate::users::SandboxUser,
        key: ContractKey,
        name: String,
        group: GroupHandle,
        is_orig: bool,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (spawned_tx, spawned_rx) = watch::channel(false);
        Arc::new(Self {
            ctx,
            manager,
            is_orig,
            user,
            name: Mutex::new(name),
            key: Mutex::new(key),
            group: Mutex::new(group),
            state: Mutex::new(ProcessState::Created),
            current_tx: Mutex::new(None),
            exec_started: Mutex::new(None),
            stderr_buf: Arc::new(Mutex::new(String::new())),
            stream_tx: Mutex::new(None),
            event_tx,
            event_rx: tokio::sync::Mutex::new(Some(event_rx)),
            pid: AtomicI32::new(0),
            spawned_tx,
            spawned_rx,
            wake: Notify::new(),
        })
    }

    // ── accessors ────────────────────────────────────────────────────────

    pub fn name(&self) -> String {
        safe_lock(&self.name).clone()
    }

    pub fn key(&self) -> ContractKey {
        safe_lock(&self.key).clone()
    }

    pub fn state(&self) -> ProcessState {
        *safe_lock(&self.state)
    }

    pub fn is_orig(&self) -> bool {
        self.is_orig
    }

    pub fn user(&self) -> crate::users::SandboxUser {
        self.user.clone()
    }

    fn set_state(&self, next: ProcessState) {
        *safe_lock(&self.state) = next;
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, next: ProcessState) {
        self.set_state(next);
    }

    #[cfg(test)]
    pub(crate) fn mark_spawned(&self) {
        let _ = self.spawned_tx.send(true);
    }

    fn group(&self) -> GroupHandle {
        safe_lock(&self.group).clone()
    }

    fn queue(&self) -> TxQueue {
        let group = self.group();
        group.queue(self.is_orig).clone()
    }

    fn is_serving(&self) -> bool {
        matches!(self.state(), ProcessState::Ready | ProcessState::Busy)
    }

    /// True while the sandbox is executing a tx; used for the group's
    /// process-need computation.
    pub fn is_executing(&self) -> bool {
        matches!(self.state(), ProcessState::Busy | ProcessState::Timeout)
    }

    // ── external entry points ────────────────────────────────────────────

    /// Install the sandbox stream after REGISTER. Drives created -> ready.
    pub fn set_stream(&self, sender: mpsc::Sender<TxMessage>) -> Result<(), String> {
        *safe_lock(&self.stream_tx) = Some(sender);
        self.event_tx
            .try_send(ProcessEvent::Registered)
            .map_err(|_| format!("process {} event channel unavailable", self.name()))
    }

    /// Sandbox -> engine direction. Messages for a process that is not
    /// serving are leftovers of a previous sandbox life (migration race);
    /// they are filtered, not errored.
    pub async fn put_sandbox_msg(&self, msg: TxMessage) {
        if !self.is_serving() {
            println!(
                "⚙️ [PROCESS] {} filtered {:?} in state {:?}",
                self.name(),
                msg.msg_type(),
                self.state()
            );
            return;
        }
        if self.event_tx.send(ProcessEvent::SandboxMsg(msg)).await.is_err() {
            eprintln!("⚠️ [PROCESS] {} event channel closed", self.name());
        }
    }

    /// Engine -> sandbox direction (syscall responses from the chain).
    pub async fn send_msg_to_sandbox(&self, msg: TxMessage) {
        if !self.is_serving() {
            return;
        }
        let sender = safe_lock(&self.stream_tx).clone();
        if let Some(sender) = sender {
            if sender.send(msg).await.is_err() {
                eprintln!("⚠️ [PROCESS] {} sandbox stream closed", self.name());
            }
        }
    }

    /// Migrate this idle process to a different contract. The manager has
    /// already moved the bookkeeping; the sandbox is killed and respawns
    /// under the new identity.
    pub async fn change_sandbox(
        &self,
        new_key: ContractKey,
        new_name: String,
        new_group: GroupHandle,
    ) -> Result<(), String> {
        if self.state() != ProcessState::Idle {
            return Err(format!(
                "change sandbox rejected: {} is {:?}, not idle",
                self.name(),
                self.state()
            ));
        }
        *safe_lock(&self.key) = new_key;
        *safe_lock(&self.name) = new_name;
        *safe_lock(&self.group) = new_group;
        *safe_lock(&self.current_tx) = None;
        self.set_state(ProcessState::Changing);
        self.kill_sandbox(libc::SIGTERM).await;
        self.wake.notify_one();
        Ok(())
    }

    /// Close this idle process for good (periodic cleanup or shutdown).
    pub async fn close_sandbox(&self) -> Result<(), String> {
        if self.state() != ProcessState::Idle {
            return Err(format!(
                "close sandbox rejected: {} is {:?}, not idle",
                self.name(),
                self.state()
            ));
        }
        self.set_state(ProcessState::Closing);
        self.kill_sandbox(libc::SIGTERM).await;
        self.wake.notify_one();
        Ok(())
    }

    async fn kill_sandbox(&self, signal: i32) {
        // Synchronize with an in-flight spawn so the kill cannot land in
        // the gap before the pid exists.
        let mut gate = self.spawned_rx.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                return;
            }
        }
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, signal);
            }
        }
    }

    // ── worker loop ──────────────────────────────────────────────────────

    pub async fn start(self: Arc<Self>) {
        let Some(mut event_rx) = self.event_rx.lock().await.take() else {
            eprintln!("❌ [PROCESS] {} started twice", self.name());
            return;
        };
        loop {
            match self.state() {
                ProcessState::Created => self.run_created(&mut event_rx).await,
                ProcessState::Ready => self.run_ready(&mut event_rx).await,
                ProcessState::Busy => self.run_busy(&mut event_rx).await,
                ProcessState::Idle => self.run_idle(&mut event_rx).await,
                ProcessState::Changing => self.run_changing(&mut event_rx).await,
                ProcessState::Closing => self.run_closing(&mut event_rx).await,
                ProcessState::Timeout => self.run_timeout(&mut event_rx).await,
                ProcessState::Dead => break,
            }
        }
    }

    async fn run_created(&self, event_rx: &mut mpsc::Receiver<ProcessEvent>) {
        match self.launch_sandbox().await {
            Ok(()) => {}
            Err(err) => {
                self.fail_spawn(err).await;
                return;
            }
        }
        loop {
            match event_rx.recv().await {
                Some(ProcessEvent::Registered) => {
                    println!("⚙️ [PROCESS] {} registered, ready", self.name());
                    self.set_state(ProcessState::Ready);
                    return;
                }
                Some(ProcessEvent::Exit(info)) => {
                    // Died before registering: restart the spawn.
                    eprintln!(
                        "⚠️ [PROCESS] {} exited during startup (code {:?}), respawning",
                        self.name(),
                        info.code
                    );
                    let _ = self.spawned_tx.send(false);
                    self.pid.store(0, Ordering::SeqCst);
                    tokio::time::sleep(RESPAWN_DELAY).await;
                    return; // state is still Created
                }
                Some(ProcessEvent::SandboxMsg(_)) => {} // pre-register chatter
                None => {
                    self.set_state(ProcessState::Dead);
                    return;
                }
            }
        }
    }

    async fn run_ready(&self, event_rx: &mut mpsc::Receiver<ProcessEvent>) {
        let deadline = tokio::time::Instant::now() + self.ctx.cfg.waiting_tx_time();
        let queue = self.queue();
        loop {
            tokio::select! {
                biased;
                ev = event_rx.recv() => match ev {
                    Some(ProcessEvent::Exit(info)) => {
                        self.handle_exit_in_ready(info).await;
                        return;
                    }
                    Some(ProcessEvent::SandboxMsg(msg)) => {
                        println!(
                            "⚙️ [PROCESS] {} dropped {:?} while ready",
                            self.name(),
                            msg.msg_type()
                        );
                    }
                    Some(ProcessEvent::Registered) => {}
                    None => {
                        self.set_state(ProcessState::Dead);
                        return;
                    }
                },
                maybe_tx = queue.pop() => match maybe_tx {
                    Some(tx) => {
                        if self.handle_tx_request(tx).await {
                            return;
                        }
                    }
                    None => tokio::time::sleep(Duration::from_secs(1)).await,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    // Nothing to do: downshift to the idle pool.
                    match self.manager.change_process_state(&self.name(), false) {
                        Ok(()) => self.set_state(ProcessState::Idle),
                        Err(e) => eprintln!("⚠️ [PROCESS] {} cannot idle: {}", self.name(), e),
                    }
                    return;
                }
            }
        }
    }

    /// Returns true when the state changed (tx dispatched or terminal).
    async fn handle_tx_request(&self, tx: PendingTx) -> bool {
        let cfg = &self.ctx.cfg;
        match classify_age(tx.age(), cfg.exec_tx_timeout(), cfg.remove_tx_time()) {
            TxAge::Stale => {
                // The chain re-sent this long ago; dropping is the protocol.
                self.ctx.metrics.txs_dropped_stale_total.inc();
                println!("⚙️ [PROCESS] {} dropped stale tx {}", self.name(), tx.tx_id());
                return false;
            }
            TxAge::Expired => {
                let err = EngineError::TxTimeout("expired before dispatch".to_string());
                self.ctx
                    .scheduler
                    .put_event(error_msg(&tx.msg.chain_id, tx.tx_id(), &err))
                    .await;
                self.ctx.metrics.tx_errors_total.inc();
                return false;
            }
            TxAge::Fresh => {}
        }

        let mut msg = tx.msg.clone();
        let depth = msg.current_depth();
        msg.cross_context = Some(CrossContext {
            process_name: self.name(),
            current_depth: depth,
        });
        if !cfg.disable_slow_log {
            msg.step_durations.push(StepDuration {
                step: "engine-dispatch".to_string(),
                start_unix_nanos: crate::types::now_nanos(),
                duration_nanos: tx.age().as_nanos() as i64,
            });
        }

        *safe_lock(&self.current_tx) = Some(tx);
        *safe_lock(&self.exec_started) = Some(Instant::now());
        self.set_state(ProcessState::Busy);

        let sender = safe_lock(&self.stream_tx).clone();
        match sender {
            Some(sender) => {
                if sender.send(msg).await.is_err() {
                    // Stream just died; the exit event will surface the
                    // panic for this tx.
                    eprintln!("⚠️ [PROCESS] {} stream closed on dispatch", self.name());
                }
            }
            None => eprintln!("❌ [PROCESS] {} busy without a stream", self.name()),
        }
        true
    }

    async fn run_busy(&self, event_rx: &mut mpsc::Receiver<ProcessEvent>) {
        let deadline = tokio::time::Instant::now() + self.ctx.cfg.exec_tx_timeout();
        loop {
            tokio::select! {
                biased;
                ev = event_rx.recv() => match ev {
                    Some(ProcessEvent::Exit(info)) => {
                        self.handle_exit_in_busy(info).await;
                        return;
                    }
                    Some(ProcessEvent::SandboxMsg(msg)) => {
                        if self.handle_sandbox_msg_busy(msg).await {
                            return;
                        }
                    }
                    Some(ProcessEvent::Registered) => {}
                    None => {
                        self.set_state(ProcessState::Dead);
                        return;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.handle_busy_timeout().await;
                    return;
                }
            }
        }
    }

    /// Returns true when the current tx completed and we are ready again.
    async fn handle_sandbox_msg_busy(&self, msg: TxMessage) -> bool {
        match msg.msg_type() {
            MsgType::TxResponse => {
                let current_id = safe_lock(&self.current_tx)
                    .as_ref()
                    .map(|t| t.msg.tx_id.clone())
                    .unwrap_or_default();
                if msg.tx_id != current_id {
                    eprintln!(
                        "⚠️ [PROCESS] {} response for {} but serving {}, dropped",
                        self.name(),
                        msg.tx_id,
                        current_id
                    );
                    return false;
                }

                self.ctx.metrics.txs_served_total.inc();
                if let Some(started) = *safe_lock(&self.exec_started) {
                    let elapsed = started.elapsed();
                    self.ctx
                        .metrics
                        .tx_exec_duration_seconds
                        .observe(elapsed.as_secs_f64());
                    if !self.ctx.cfg.disable_slow_log && elapsed > SLOW_TX_THRESHOLD {
                        println!(
                            "🐢 [PROCESS] {} slow tx {}: {:?}",
                            self.name(),
                            msg.tx_id,
                            elapsed
                        );
                    }
                }

                let failed_deploy = {
                    let current = safe_lock(&self.current_tx);
                    let is_deploy = current.as_ref().map(|t| t.msg.is_deploy_tx()).unwrap_or(false);
                    let resp_failed = msg
                        .response
                        .as_ref()
                        .map(|r| r.code == RespCode::Fail as i32)
                        .unwrap_or(false);
                    is_deploy && resp_failed
                };

                if self.ctx.chain_tx.send(msg).await.is_err() {
                    eprintln!("❌ [PROCESS] {} chain channel closed", self.name());
                }

                // The current tx is retained: the exit decision table
                // consults it if the sandbox dies while we are ready.
                self.set_state(ProcessState::Ready);

                if failed_deploy {
                    // Deployment failed inside a healthy sandbox: the
                    // binary is dysfunctional for this contract. The exit
                    // lands in ready and takes the bad-contract row.
                    println!(
                        "⚠️ [PROCESS] {} deploy failed, retiring sandbox",
                        self.name()
                    );
                    self.kill_sandbox(libc::SIGTERM).await;
                }
                true
            }
            MsgType::GetStateRequest
            | MsgType::GetBatchStateRequest
            | MsgType::CallContractRequest
            | MsgType::CreateKvIteratorRequest
            | MsgType::ConsumeKvIteratorRequest
            | MsgType::CreateKeyHistoryIterRequest
            | MsgType::ConsumeKeyHistoryIterRequest
            | MsgType::GetSenderAddressRequest
            | MsgType::GetBytecodeRequest
            | MsgType::Completed => {
                // Syscall: up to the chain, response returns via the
                // process-name route.
                if self.ctx.chain_tx.send(msg).await.is_err() {
                    eprintln!("❌ [PROCESS] {} chain channel closed", self.name());
                }
                false
            }
            other => {
                println!("⚙️ [PROCESS] {} dropped {:?} while busy", self.name(), other);
                false
            }
        }
    }

    async fn handle_busy_timeout(&self) {
        self.set_state(ProcessState::Timeout);
        self.ctx.metrics.tx_timeouts_total.inc();
        let tx_id = safe_lock(&self.current_tx)
            .as_ref()
            .map(|t| t.msg.tx_id.clone())
            .unwrap_or_default();
        eprintln!(
            "⏱️ [PROCESS] {} tx {} exceeded {}s, killing sandbox",
            self.name(),
            tx_id,
            self.ctx.cfg.exec_tx_timeout_secs
        );

        // SIGINT first so the sandbox can dump diagnostics, SIGKILL after
        // the grace.
        self.kill_sandbox(libc::SIGINT).await;
        let pid = self.pid.load(Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(SIGKILL_GRACE).await;
            if pid > 0 {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        });
    }

    async fn run_idle(&self, event_rx: &mut mpsc::Receiver<ProcessEvent>) {
        let queue = self.queue();
        tokio::select! {
            biased;
            ev = event_rx.recv() => match ev {
                Some(ProcessEvent::Exit(_)) => {
                    self.report_exit().await;
                    self.set_state(ProcessState::Dead);
                }
                Some(ProcessEvent::SandboxMsg(msg)) => {
                    println!(
                        "⚙️ [PROCESS] {} filtered {:?} while idle",
                        self.name(),
                        msg.msg_type()
                    );
                }
                Some(ProcessEvent::Registered) => {}
                None => self.set_state(ProcessState::Dead),
            },
            _ = self.wake.notified() => {
                // State was rewritten by change_sandbox/close_sandbox;
                // the outer loop re-dispatches.
            }
            maybe_tx = queue.pop() => {
                if let Some(tx) = maybe_tx {
                    // The manager may already have promised this process
                    // elsewhere: hand the tx back and try to promote.
                    self.ctx.scheduler.put_tx(tx).await;
                    if self.manager.change_process_state(&self.name(), true).is_ok() {
                        self.set_state(ProcessState::Ready);
                    }
                } else {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn run_changing(&self, event_rx: &mut mpsc::Receiver<ProcessEvent>) {
        loop {
            match event_rx.recv().await {
                Some(ProcessEvent::Exit(_)) => {
                    // Identity already points at the new contract; respawn.
                    let _ = self.spawned_tx.send(false);
                    self.pid.store(0, Ordering::SeqCst);
                    *safe_lock(&self.stream_tx) = None;
                    self.set_state(ProcessState::Created);
                    return;
                }
                Some(_) => {} // final messages of the old sandbox
                None => {
                    self.set_state(ProcessState::Dead);
                    return;
                }
            }
        }
    }

    async fn run_closing(&self, event_rx: &mut mpsc::Receiver<ProcessEvent>) {
        loop {
            match event_rx.recv().await {
                Some(ProcessEvent::Exit(_)) | None => {
                    // Normal cleanup; bookkeeping was already dropped.
                    self.report_exit().await;
                    self.set_state(ProcessState::Dead);
                    return;
                }
                Some(_) => {}
            }
        }
    }

    async fn run_timeout(&self, event_rx: &mut mpsc::Receiver<ProcessEvent>) {
        loop {
            match event_rx.recv().await {
                Some(ProcessEvent::Exit(_)) | None => {
                    let pending = safe_lock(&self.current_tx).take();
                    if let Some(tx) = pending {
                        let err = EngineError::TxTimeout(format!(
                            "sandbox killed after {}s",
                            self.ctx.cfg.exec_tx_timeout_secs
                        ));
                        self.ctx
                            .scheduler
                            .put_event(error_msg(&tx.msg.chain_id, tx.tx_id(), &err))
                            .await;
                        self.ctx.metrics.tx_errors_total.inc();
                    }
                    self.report_exit().await;
                    self.set_state(ProcessState::Dead);
                    return;
                }
                Some(_) => {}
            }
        }
    }

    async fn handle_exit_in_ready(&self, info: ExitInfo) {
        eprintln!(
            "⚠️ [PROCESS] {} sandbox exited while ready (code {:?})",
            self.name(),
            info.code
        );
        let deploy = safe_lock(&self.current_tx)
            .as_ref()
            .map(|t| (t.msg.is_deploy_tx(), t.msg.tx_id.clone(), t.cfv));
        if let Some((true, tx_id, cfv)) = deploy {
            self.report_bad_contract(&tx_id, cfv).await;
        }
        self.report_exit().await;
        self.set_state(ProcessState::Dead);
    }

    async fn handle_exit_in_busy(&self, info: ExitInfo) {
        let reason = {
            let buf = safe_lock(&self.stderr_buf);
            if buf.is_empty() {
                format!("exit code {:?}", info.code)
            } else {
                buf.clone()
            }
        };
        let pending = safe_lock(&self.current_tx).take();
        if let Some(tx) = pending {
            eprintln!(
                "❌ [PROCESS] {} sandbox panicked mid-tx {}: {}",
                self.name(),
                tx.tx_id(),
                reason
            );
            let err = EngineError::RuntimePanic(reason);
            self.ctx
                .scheduler
                .put_event(error_msg(&tx.msg.chain_id, tx.tx_id(), &err))
                .await;
            self.ctx.metrics.tx_errors_total.inc();
            if tx.msg.is_deploy_tx() {
                self.report_bad_contract(tx.tx_id(), tx.cfv).await;
            }
        }
        self.report_exit().await;
        self.set_state(ProcessState::Dead);
    }

    async fn report_exit(&self) {
        self.ctx.metrics.sandbox_exits_total.inc();
        if self
            .manager
            .event_tx
            .send(ManagerEvent::SandboxExit {
                process_name: self.name(),
            })
            .await
            .is_err()
        {
            eprintln!("❌ [PROCESS] {} manager channel closed", self.name());
        }
    }

    async fn report_bad_contract(&self, tx_id: &str, cfv: i64) {
        let group = self.group();
        if group
            .event_tx
            .send(GroupEvent::BadContract {
                tx_id: tx_id.to_string(),
                cfv,
            })
            .await
            .is_err()
        {
            eprintln!("⚠️ [PROCESS] {} group channel closed", self.name());
        }
    }

    /// Launch failure rows of the exit decision table.
    async fn fail_spawn(&self, err: EngineError) {
        let queue = self.queue();
        match &err {
            EngineError::ContractNotExist(path) => {
                eprintln!("❌ [PROCESS] {} binary missing: {}", self.name(), path);
                if let Some(tx) = queue.try_pop() {
                    // The chain refetches after the bad-contract eviction;
                    // the tx itself goes back through the scheduler.
                    self.report_bad_contract(&tx.msg.tx_id.clone(), tx.cfv).await;
                    self.ctx.scheduler.put_tx(tx).await;
                }
            }
            _ => {
                eprintln!("❌ [PROCESS] {} sandbox failed to start: {}", self.name(), err);
                if let Some(tx) = queue.try_pop() {
                    self.ctx
                        .scheduler
                        .put_event(error_msg(&tx.msg.chain_id, tx.tx_id(), &err))
                        .await;
                    self.ctx.metrics.tx_errors_total.inc();
                    self.report_bad_contract(tx.tx_id(), tx.cfv).await;
                }
            }
        }
        self.report_exit().await;
        self.set_state(ProcessState::Dead);
    }

    // ── spawn ────────────────────────────────────────────────────────────

    async fn launch_sandbox(&self) -> Result<(), EngineError> {
        let cfg = &self.ctx.cfg;
        let key = self.key();
        let canonical = key.canonical();
        let name = self.name();
        let path = cfg.contract_bin_path(&canonical);
        if !path.exists() {
            return Err(EngineError::ContractNotExist(path.display().to_string()));
        }

        safe_lock(&self.stderr_buf).clear();

        let mut cmd = Command::new(&path);
        cmd.args([
            self.user.sandbox_sock_path.clone(),
            name.clone(),
            key.contract_name.clone(),
            key.contract_version.clone(),
            cfg.log_level.clone(),
            cfg.sandbox_rpc_port.to_string(),
            cfg.chain_host.clone(),
            cfg.disable_slow_log.to_string(),
            cfg.max_send_msg_size_mib.to_string(),
            cfg.max_recv_msg_size_mib.to_string(),
        ])
        .env("CONTRACT_ADDRESS", &canonical)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        if cfg.enable_isolation {
            let uid = self.user.uid;
            let gid = self.user.gid;
            unsafe {
                cmd.pre_exec(move || {
                    // New PID namespace first: it needs privileges that are
                    // gone once we drop to the sandbox uid.
                    if libc::unshare(libc::CLONE_NEWPID) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setgid(gid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::ContractExec(e.to_string()))?;
        let pid = child.id().unwrap_or(0) as i32;
        self.pid.store(pid, Ordering::SeqCst);
        attach_cgroup(&cfg.cgroup_procs_file, pid);

        if let Some(stdout) = child.stdout.take() {
            let log_path =
                std::path::PathBuf::from(&cfg.log_dir).join(format!("{}.log", canonical));
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut sink = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .await
                    .ok();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(f) = sink.as_mut() {
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let buf = self.stderr_buf.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buf = safe_lock(&buf);
                    if buf.len() < STDERR_CAP {
                        if !buf.is_empty() {
                            buf.push('\n');
                        }
                        buf.push_str(&line);
                    }
                }
            });
        }

        let _ = self.spawned_tx.send(true);

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            let _ = event_tx.send(ProcessEvent::Exit(ExitInfo { code })).await;
        });

        self.ctx.metrics.processes_created_total.inc();
        println!("🚀 [PROCESS] {} spawned sandbox pid {} (uid {})", name, pid, self.user.uid);
        Ok(())
    }
}

/// Place the sandbox under the engine's resource class. Line-oriented
/// append; many spawns write this file concurrently.
fn attach_cgroup(procs_file: &str, pid: i32) {
    use std::io::Write;
    let result = std::fs::OpenOptions::new()
        .append(true)
        .open(procs_file)
        .and_then(|mut f| writeln!(f, "{}", pid));
    if let Err(e) = result {
        eprintln!("⚠️ [PROCESS] cgroup attach of {} failed: {}", pid, e);
    }
}
