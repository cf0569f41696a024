// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - CONTRACT MANAGER
//
// Size-bounded LRU of contract binaries on local disk.
// - Cache hit: signal ContractReady(OK) to the owning Request Group
// - Miss: forward GET_BYTECODE_REQUEST to the chain, insert on response
// - Eviction and bad-contract reports delete the on-disk file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::types::{ContractEvent, EngineContext, GroupEvent, lookup_group};
use forge_protocol::{ContractKey, MsgType, RespCode, TxMessage};
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ContractManager {
    ctx: Arc<EngineContext>,
    event_rx: mpsc::Receiver<ContractEvent>,
    /// canonical key -> absolute path of the binary.
    cache: LruCache<String, PathBuf>,
    /// Keys with an outstanding upstream fetch; dedups chain traffic.
    awaiting: HashSet<String>,
}

impl ContractManager {
    pub fn new(ctx: Arc<EngineContext>, event_rx: mpsc::Receiver<ContractEvent>) -> Self {
        let cap = NonZeroUsize::new(ctx.cfg.contract_lru_cap())
            .unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            ctx,
            event_rx,
            cache: LruCache::new(cap),
            awaiting: HashSet::new(),
        }
    }

    pub async fn start(mut self) {
        self.startup_scan();
        println!(
            "📦 [CONTRACTS] manager up, {} cached, cap {}",
            self.cache.len(),
            self.cache.cap()
        );
        while let Some(event) = self.event_rx.recv().await {
            match event {
                ContractEvent::GetContractReq { key, tx_id } => {
                    self.handle_get_contract_req(&key, &tx_id).await;
                }
                ContractEvent::GetContractResp { msg } => {
                    self.handle_get_contract_resp(msg).await;
                }
                ContractEvent::BadContract { key } => {
                    self.handle_bad_contract(&key);
                }
            }
        }
    }

    /// Reconcile disk with the cache bound at startup. Files are adopted
    /// newest-first; anything beyond the cap is deleted.
    fn startup_scan(&mut self) {
        let dir = self.ctx.cfg.contract_bins_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("❌ [CONTRACTS] cannot create {}: {}", dir.display(), e);
            return;
        }
        let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let Ok(read_dir) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            entries.push((mtime, path));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        let cap = self.cache.cap().get();
        for (i, (_, path)) in entries.into_iter().enumerate() {
            if i < cap {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    self.cache.put(name.to_string(), path.clone());
                }
            } else if let Err(e) = std::fs::remove_file(&path) {
                eprintln!("⚠️ [CONTRACTS] stale file {} not removed: {}", path.display(), e);
            }
        }
        self.ctx
            .metrics
            .contract_cache_entries
            .set(self.cache.len() as i64);
    }

    async fn handle_get_contract_req(&mut self, key: &ContractKey, tx_id: &str) {
        let canonical = key.canonical();
        if self.cache.get(&canonical).is_some() {
            self.notify_ready(key, true).await;
            return;
        }
        if self.awaiting.contains(&canonical) {
            // Another tx already triggered the fetch; the group buffers.
            return;
        }
        self.awaiting.insert(canonical);
        self.ctx.metrics.bytecode_requests_total.inc();
        let req = forge_protocol::bytecode_request_msg(tx_id, key);
        if self.ctx.chain_tx.send(req).await.is_err() {
            eprintln!("❌ [CONTRACTS] chain channel closed, cannot fetch {}", key);
        }
    }

    async fn handle_get_contract_resp(&mut self, msg: TxMessage) {
        if msg.msg_type() != MsgType::GetBytecodeResponse {
            eprintln!("⚠️ [CONTRACTS] unexpected msg type {:?}", msg.msg_type());
            return;
        }
        let Some(resp) = msg.get_bytecode_response else {
            eprintln!("⚠️ [CONTRACTS] bytecode response without payload, tx {}", msg.tx_id);
            return;
        };
        let Some(id) = resp.contract.as_ref() else {
            eprintln!("⚠️ [CONTRACTS] bytecode response without contract id, tx {}", msg.tx_id);
            return;
        };
        let key = ContractKey::from_contract_id(id);
        let canonical = key.canonical();
        self.awaiting.remove(&canonical);

        if resp.code != RespCode::Ok as i32 {
            eprintln!("❌ [CONTRACTS] chain failed to supply {}: {}", key, resp.message);
            self.ctx.metrics.bytecode_failures_total.inc();
            self.notify_ready(&key, false).await;
            return;
        }

        // LRU at capacity: the oldest entry loses its slot and its file.
        if self.cache.len() == self.cache.cap().get() {
            if let Some((evicted_key, evicted_path)) = self.cache.pop_lru() {
                remove_contract_file(&evicted_path);
                self.ctx.metrics.contract_evictions_total.inc();
                println!("📦 [CONTRACTS] evicted {} for {}", evicted_key, canonical);
            }
        }

        let path = self.ctx.cfg.contract_bin_path(&canonical);
        if !resp.bytecode.is_empty() {
            // TCP transport: bytecode travels inline and we own the write.
            if let Err(e) = write_contract_file(&path, &resp.bytecode) {
                eprintln!("❌ [CONTRACTS] cannot write {}: {}", path.display(), e);
                self.ctx.metrics.bytecode_failures_total.inc();
                self.notify_ready(&key, false).await;
                return;
            }
        } else if !path.exists() {
            // UDS transport: the chain wrote the shared mount itself.
            eprintln!("❌ [CONTRACTS] chain reported {} ready but file missing", canonical);
            self.ctx.metrics.bytecode_failures_total.inc();
            self.notify_ready(&key, false).await;
            return;
        }

        self.cache.put(canonical, path);
        self.ctx
            .metrics
            .contract_cache_entries
            .set(self.cache.len() as i64);
        self.notify_ready(&key, true).await;
    }

    /// A running sandbox reported the binary as corrupt or unloadable. The
    /// group already fenced the report by contract file version.
    fn handle_bad_contract(&mut self, key: &ContractKey) {
        let canonical = key.canonical();
        if let Some(path) = self.cache.pop(&canonical) {
            remove_contract_file(&path);
            println!("📦 [CONTRACTS] dropped bad contract {}", canonical);
        }
        self.ctx.metrics.bad_contract_reports_total.inc();
        self.ctx
            .metrics
            .contract_cache_entries
            .set(self.cache.len() as i64);
    }

    async fn notify_ready(&self, key: &ContractKey, ok: bool) {
        let Some(group) = lookup_group(&self.ctx.scheduler.groups, &key.canonical()) else {
            eprintln!("⚠️ [CONTRACTS] no group for {} to notify", key);
            return;
        };
        if group
            .event_tx
            .send(GroupEvent::ContractReady { ok })
            .await
            .is_err()
        {
            eprintln!("⚠️ [CONTRACTS] group {} event channel closed", key);
        }
    }

    #[cfg(test)]
    fn cached_keys(&self) -> Vec<String> {
        self.cache.iter().map(|(k, _)| k.clone()).collect()
    }
}

fn write_contract_file(path: &PathBuf, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(path, bytes).map_err(|e| e.to_string())?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn remove_contract_file(path: &PathBuf) {
    if let Err(e) = std::fs::remove_file(path) {
        eprintln!("⚠️ [CONTRACTS] file {} not removed: {}", path.display(), e);
    }
}
