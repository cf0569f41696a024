// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - ENGINE CONFIGURATION
//
// All tunables for the coordination core, loaded from config.toml.
// - Every field has a default so an empty file is a valid config
// - FORGE_CONFIG env var overrides the config path
// - Derived values (cross pool cap, user pool size, LRU cap) are methods
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use forge_protocol::CALL_CONTRACT_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Disk budget reserved per cached contract binary (MiB). The contract LRU
/// capacity is `max_contract_file_size_mib / SIZE_PER_CONTRACT_MIB`.
pub const SIZE_PER_CONTRACT_MIB: u64 = 15;

/// Bound of the engine->chain event channel. Sized so overrun indicates a
/// design error rather than a load condition.
pub const CHAIN_EVENT_CH_SIZE: usize = 50_000;

/// Per-side tx queue bound inside a Request Group.
pub const TX_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// UNIX domain sockets, chain and engine share a host (default).
    Uds,
    /// TCP, bytecode travels inline in GET_BYTECODE_RESPONSE.
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ── transport ────────────────────────────────────────────────────────
    pub transport: Transport,
    pub chain_host: String,
    pub chain_rpc_port: u16,
    pub sandbox_rpc_port: u16,
    pub sock_dir: String,
    pub chain_sock_name: String,
    pub sandbox_sock_name: String,
    pub max_send_msg_size_mib: u32,
    pub max_recv_msg_size_mib: u32,
    pub keepalive_time_secs: u64,
    pub keepalive_timeout_secs: u64,

    // ── process pools ────────────────────────────────────────────────────
    /// Cap of the original-tx pool. The cross pool cap is this times
    /// CALL_CONTRACT_DEPTH.
    pub max_original_process_num: usize,
    pub exec_tx_timeout_secs: u64,
    /// Ready process with no traffic downshifts to idle after this long.
    pub waiting_tx_time_ms: u64,
    /// A tx older than this at pickup is dropped silently (chain retries).
    pub remove_tx_time_secs: u64,
    pub get_bytecode_timeout_secs: u64,
    pub release_period_secs: u64,
    /// Target free-slot ratio for the periodic release, in percent.
    pub release_rate_pct: u64,

    // ── contract storage ─────────────────────────────────────────────────
    pub mount_dir: String,
    pub max_contract_file_size_mib: u64,

    // ── sandbox environment ──────────────────────────────────────────────
    pub log_dir: String,
    pub log_level: String,
    pub disable_slow_log: bool,
    /// First uid of the reserved contiguous range for sandbox users.
    pub uid_start: u32,
    /// Invoke useradd/userdel for real. Off in tests and unprivileged runs.
    pub create_sys_users: bool,
    /// Run sandboxes under their assigned uid inside a fresh PID namespace.
    /// Off in tests and unprivileged runs.
    pub enable_isolation: bool,
    pub cgroup_procs_file: String,

    // ── observability ────────────────────────────────────────────────────
    /// Port of the node's HTTP endpoint (/metrics, /status).
    pub metrics_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Uds,
            chain_host: "127.0.0.1".to_string(),
            chain_rpc_port: 22351,
            sandbox_rpc_port: 32351,
            sock_dir: "/tmp/forge/sock".to_string(),
            chain_sock_name: "chain.sock".to_string(),
            sandbox_sock_name: "sandbox.sock".to_string(),
            max_send_msg_size_mib: 100,
            max_recv_msg_size_mib: 100,
            keepalive_time_secs: 60,
            keepalive_timeout_secs: 20,

            max_original_process_num: 20,
            exec_tx_timeout_secs: 8,
            waiting_tx_time_ms: 1000,
            remove_tx_time_secs: 9,
            get_bytecode_timeout_secs: 6,
            release_period_secs: 30,
            release_rate_pct: 30,

            mount_dir: "/mnt/forge".to_string(),
            max_contract_file_size_mib: 1024,

            log_dir: "/var/log/forge".to_string(),
            log_level: "info".to_string(),
            disable_slow_log: false,
            uid_start: 24000,
            create_sys_users: true,
            enable_isolation: true,
            cgroup_procs_file: "/sys/fs/cgroup/forge/cgroup.procs".to_string(),

            metrics_port: 9095,
        }
    }
}

impl EngineConfig {
    /// Load from a toml file. Missing file yields the defaults; a malformed
    /// file is a startup error.
    pub fn load(path: &str) -> Result<Self, String> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                println!("⚙️ [CONFIG] {} not found, using defaults", path);
                return Ok(Self::default());
            }
        };
        let cfg: EngineConfig =
            toml::from_str(&raw).map_err(|e| format!("bad config {}: {}", path, e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_original_process_num == 0 {
            return Err("max_original_process_num must be > 0".to_string());
        }
        if self.release_rate_pct > 100 {
            return Err("release_rate_pct must be <= 100".to_string());
        }
        if self.max_contract_file_size_mib < SIZE_PER_CONTRACT_MIB {
            return Err(format!(
                "max_contract_file_size_mib must be >= {}",
                SIZE_PER_CONTRACT_MIB
            ));
        }
        Ok(())
    }

    /// Cap of the cross-tx pool.
    pub fn max_cross_process_num(&self) -> usize {
        self.max_original_process_num * CALL_CONTRACT_DEPTH as usize
    }

    /// Users provisioned at startup: one per possible concurrent sandbox
    /// across both pools.
    pub fn user_pool_size(&self) -> usize {
        self.max_original_process_num * (CALL_CONTRACT_DEPTH as usize + 1)
    }

    /// Slots in the contract binary LRU.
    pub fn contract_lru_cap(&self) -> usize {
        ((self.max_contract_file_size_mib / SIZE_PER_CONTRACT_MIB) as usize).max(1)
    }

    pub fn contract_bins_dir(&self) -> PathBuf {
        PathBuf::from(&self.mount_dir).join("contract-bins")
    }

    pub fn contract_bin_path(&self, canonical_key: &str) -> PathBuf {
        self.contract_bins_dir().join(canonical_key)
    }

    pub fn sandbox_sock_path(&self) -> String {
        format!("{}/{}", self.sock_dir, self.sandbox_sock_name)
    }

    pub fn chain_sock_path(&self) -> String {
        format!("{}/{}", self.sock_dir, self.chain_sock_name)
    }

    pub fn exec_tx_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_tx_timeout_secs)
    }

    pub fn waiting_tx_time(&self) -> Duration {
        Duration::from_millis(self.waiting_tx_time_ms)
    }

    pub fn remove_tx_time(&self) -> Duration {
        Duration::from_secs(self.remove_tx_time_secs)
    }

    pub fn get_bytecode_timeout(&self) -> Duration {
        Duration::from_secs(self.get_bytecode_timeout_secs)
    }

    pub fn release_period(&self) -> Duration {
        Duration::from_secs(self.release_period_secs)
    }
}
