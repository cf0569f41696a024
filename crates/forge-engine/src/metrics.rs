// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - METRICS MODULE
//
// Prometheus-compatible metrics for production monitoring.
// Registered here, exposed by forge-node on /metrics.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

/// Global metrics registry for the engine.
pub struct EngineMetrics {
    registry: Registry,

    // Process pool metrics
    pub processes_created_total: IntCounter,
    pub processes_migrated_total: IntCounter,
    pub processes_closed_total: IntCounter,
    pub sandbox_exits_total: IntCounter,
    pub orig_idle_processes: IntGauge,
    pub orig_busy_processes: IntGauge,
    pub cross_idle_processes: IntGauge,
    pub cross_busy_processes: IntGauge,

    // Tx metrics
    pub txs_served_total: IntCounter,
    pub tx_timeouts_total: IntCounter,
    pub tx_errors_total: IntCounter,
    pub txs_dropped_stale_total: IntCounter,
    pub tx_exec_duration_seconds: Histogram,

    // Contract cache metrics
    pub bytecode_requests_total: IntCounter,
    pub bytecode_failures_total: IntCounter,
    pub contract_cache_entries: IntGauge,
    pub contract_evictions_total: IntCounter,
    pub bad_contract_reports_total: IntCounter,

    // Routing metrics
    pub request_groups: IntGauge,
    pub depth_rejections_total: IntCounter,

    // User pool metrics
    pub users_available: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();

        let int_counter = |name: &str, help: &str| -> Result<IntCounter, String> {
            let c = IntCounter::new(name, help).map_err(|e| e.to_string())?;
            registry.register(Box::new(c.clone())).map_err(|e| e.to_string())?;
            Ok(c)
        };
        let int_gauge = |name: &str, help: &str| -> Result<IntGauge, String> {
            let g = IntGauge::new(name, help).map_err(|e| e.to_string())?;
            registry.register(Box::new(g.clone())).map_err(|e| e.to_string())?;
            Ok(g)
        };

        let tx_exec_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "forge_tx_exec_duration_seconds",
                "Wall time a sandbox spent executing one tx",
            )
            .buckets(vec![0.005, 0.02, 0.1, 0.5, 1.0, 2.0, 4.0, 8.0]),
        )
        .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(tx_exec_duration_seconds.clone()))
            .map_err(|e| e.to_string())?;

        Ok(Self {
            processes_created_total: int_counter(
                "forge_processes_created_total",
                "Sandbox processes launched",
            )?,
            processes_migrated_total: int_counter(
                "forge_processes_migrated_total",
                "Idle processes migrated to another contract",
            )?,
            processes_closed_total: int_counter(
                "forge_processes_closed_total",
                "Idle processes closed by periodic cleanup",
            )?,
            sandbox_exits_total: int_counter(
                "forge_sandbox_exits_total",
                "Sandbox OS process exits observed",
            )?,
            orig_idle_processes: int_gauge(
                "forge_orig_idle_processes",
                "Idle processes in the original pool",
            )?,
            orig_busy_processes: int_gauge(
                "forge_orig_busy_processes",
                "Busy processes in the original pool",
            )?,
            cross_idle_processes: int_gauge(
                "forge_cross_idle_processes",
                "Idle processes in the cross pool",
            )?,
            cross_busy_processes: int_gauge(
                "forge_cross_busy_processes",
                "Busy processes in the cross pool",
            )?,
            txs_served_total: int_counter("forge_txs_served_total", "Tx responses returned")?,
            tx_timeouts_total: int_counter(
                "forge_tx_timeouts_total",
                "Txs killed by the execution deadline",
            )?,
            tx_errors_total: int_counter(
                "forge_tx_errors_total",
                "Terminal tx errors returned to the chain",
            )?,
            txs_dropped_stale_total: int_counter(
                "forge_txs_dropped_stale_total",
                "Txs dropped silently for exceeding the age cap",
            )?,
            tx_exec_duration_seconds,
            bytecode_requests_total: int_counter(
                "forge_bytecode_requests_total",
                "GET_BYTECODE_REQUESTs sent to the chain",
            )?,
            bytecode_failures_total: int_counter(
                "forge_bytecode_failures_total",
                "Bytecode fetches that failed or timed out",
            )?,
            contract_cache_entries: int_gauge(
                "forge_contract_cache_entries",
                "Contract binaries currently cached on disk",
            )?,
            contract_evictions_total: int_counter(
                "forge_contract_evictions_total",
                "Contract binaries evicted from the LRU",
            )?,
            bad_contract_reports_total: int_counter(
                "forge_bad_contract_reports_total",
                "Accepted bad-contract reports",
            )?,
            request_groups: int_gauge("forge_request_groups", "Live request groups")?,
            depth_rejections_total: int_counter(
                "forge_depth_rejections_total",
                "Txs rejected for exceeding the call depth ceiling",
            )?,
            users_available: int_gauge(
                "forge_users_available",
                "Sandbox users currently in the free pool",
            )?,
            registry,
        })
    }

    /// Encode all metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            eprintln!("⚠️ [METRICS] encode failed: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
