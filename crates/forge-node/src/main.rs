// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - ENGINE NODE
//
// Main entry point for the forge-node binary.
// Loads config, starts the execution engine, serves /metrics and /status,
// and handles SIGINT (diagnostic dump + graceful stop) and SIGTERM.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use forge_engine::{EngineConfig, SandboxEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use warp::Filter;

/// Patience for the graceful drain before the process force-exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn config_path() -> String {
    if let Some(path) = std::env::args().nth(1) {
        return path;
    }
    std::env::var("FORGE_CONFIG").unwrap_or_else(|_| "config.toml".to_string())
}

#[tokio::main]
async fn main() {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("⚡ FORGE NODE v{}", env!("CARGO_PKG_VERSION"));
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let path = config_path();
    let cfg = match EngineConfig::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ [NODE] {}", e);
            std::process::exit(1);
        }
    };
    let metrics_port = cfg.metrics_port;

    let engine = match SandboxEngine::start(cfg).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("❌ [NODE] engine failed to start: {}", e);
            std::process::exit(1);
        }
    };

    // Observability endpoint, loopback only.
    {
        let metrics_engine = engine.clone();
        let status_engine = engine.clone();
        let metrics_route = warp::path("metrics")
            .map(move || metrics_engine.metrics_text());
        let status_route = warp::path("status").map(move || {
            warp::reply::json(&serde_json::json!({
                "state": status_engine.diagnostic_dump(),
            }))
        });
        let routes = metrics_route.or(status_route);
        tokio::spawn(async move {
            warp::serve(routes).run(([127, 0, 0, 1], metrics_port)).await;
        });
        println!("📈 [NODE] metrics on http://127.0.0.1:{}/metrics", metrics_port);
    }

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ [NODE] cannot install SIGINT handler: {}", e);
            std::process::exit(1);
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ [NODE] cannot install SIGTERM handler: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            println!("🛑 [NODE] SIGINT: {}", engine.diagnostic_dump());
        }
        _ = sigterm.recv() => {
            println!("🛑 [NODE] SIGTERM");
        }
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, engine.shutdown())
        .await
        .is_err()
    {
        eprintln!(
            "⚠️ [NODE] shutdown exceeded {}s, forcing exit",
            SHUTDOWN_GRACE.as_secs()
        );
        std::process::exit(1);
    }
}
