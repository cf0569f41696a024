// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - USER MANAGER
//
// Recycled pool of OS identities for sandboxes.
// - Uids drawn from a reserved contiguous range starting at uid_start
// - useradd at startup (slow, so the whole set is pre-built concurrently)
// - FIFO hand-out over a bounded channel; userdel only at shutdown
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::types::safe_lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// `useradd` exit code when the account already exists (a previous engine
/// run provisioned it); treated as success.
const USERADD_ALREADY_EXISTS: i32 = 9;

const CREATE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// One OS identity a sandbox runs under. Single-owner while a sandbox holds
/// it; returned to the pool when the sandbox exits.
#[derive(Debug, Clone)]
pub struct SandboxUser {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub sandbox_sock_path: String,
}

pub struct UserManager {
    cfg: Arc<EngineConfig>,
    metrics: Arc<EngineMetrics>,
    free_tx: mpsc::Sender<SandboxUser>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<SandboxUser>>,
    /// Every user ever provisioned, for userdel at shutdown.
    created: Mutex<Vec<SandboxUser>>,
}

impl UserManager {
    pub fn new(cfg: Arc<EngineConfig>, metrics: Arc<EngineMetrics>) -> Self {
        let (free_tx, free_rx) = mpsc::channel(cfg.user_pool_size().max(1));
        Self {
            cfg,
            metrics,
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Provision the whole pool concurrently. Each creation retries until
    /// the OS accepts it; a machine that cannot create users never finishes
    /// startup, by design of the caller (startup blocks on this).
    pub async fn batch_create_users(&self) -> Result<(), String> {
        let n = self.cfg.user_pool_size();
        let mut set = JoinSet::new();
        for i in 0..n {
            let uid = self.cfg.uid_start + i as u32;
            let cfg = self.cfg.clone();
            set.spawn(async move { create_user(&cfg, uid).await });
        }

        while let Some(joined) = set.join_next().await {
            let user = joined.map_err(|e| format!("user creation task failed: {}", e))?;
            safe_lock(&self.created).push(user.clone());
            self.free_tx
                .send(user)
                .await
                .map_err(|_| "user pool channel closed".to_string())?;
            self.metrics.users_available.inc();
        }

        println!("✅ [USERS] provisioned {} sandbox users (uid {}..)", n, self.cfg.uid_start);
        Ok(())
    }

    /// Blocks until a user is free. Pool consumers hold at most one user
    /// each and the pool is sized to the pool caps, so this only waits
    /// during exit/respawn races.
    pub async fn get_available_user(&self) -> Option<SandboxUser> {
        let user = self.free_rx.lock().await.recv().await;
        if user.is_some() {
            self.metrics.users_available.dec();
        }
        user
    }

    /// Return a user to the tail of the FIFO.
    pub async fn free_user(&self, user: SandboxUser) {
        if self.free_tx.send(user).await.is_err() {
            eprintln!("⚠️ [USERS] free pool closed, dropping user");
            return;
        }
        self.metrics.users_available.inc();
    }

    /// Destroy the pool at shutdown.
    pub async fn release_users(&self) {
        let users: Vec<SandboxUser> = safe_lock(&self.created).drain(..).collect();
        for user in users {
            if !self.cfg.create_sys_users {
                continue;
            }
            match Command::new("userdel").arg(&user.username).output().await {
                Ok(out) if out.status.success() => {}
                Ok(out) => eprintln!(
                    "⚠️ [USERS] userdel {} failed: {}",
                    user.username,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Err(e) => eprintln!("⚠️ [USERS] userdel {} failed: {}", user.username, e),
            }
        }
        println!("✅ [USERS] released user pool");
    }

    pub fn pool_capacity(&self) -> usize {
        self.cfg.user_pool_size()
    }
}

/// Username is derived from the uid so a crashed engine finds the same
/// accounts on restart.
pub fn username_for(uid: u32) -> String {
    format!("u-{}", uid)
}

async fn create_user(cfg: &EngineConfig, uid: u32) -> SandboxUser {
    let username = username_for(uid);
    let user = SandboxUser {
        uid,
        gid: uid,
        username: username.clone(),
        sandbox_sock_path: cfg.sandbox_sock_path(),
    };
    if !cfg.create_sys_users {
        return user;
    }

    // Retry indefinitely on transient failure; useradd contention with
    // concurrent creations shows up as lock errors on /etc/passwd.
    loop {
        let result = Command::new("useradd")
            .args([
                "-u",
                &uid.to_string(),
                "-M",
                "-s",
                "/sbin/nologin",
                &username,
            ])
            .output()
            .await;
        match result {
            Ok(out) if out.status.success() => return user,
            Ok(out) if out.status.code() == Some(USERADD_ALREADY_EXISTS) => return user,
            Ok(out) => eprintln!(
                "⚠️ [USERS] useradd {} failed (retrying): {}",
                username,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => eprintln!("⚠️ [USERS] useradd {} failed (retrying): {}", username, e),
        }
        tokio::time::sleep(CREATE_RETRY_DELAY).await;
    }
}
