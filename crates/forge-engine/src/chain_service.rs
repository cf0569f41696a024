// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - CHAIN RPC SERVICE
//
// The engine's north side: one duplex stream to the chain node.
// - Inbound: tx requests, bytecode responses, syscall responses
// - Outbound: a single engine-wide channel, owned by the live connection
// - Serves over UDS (default) or TCP per config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::config::{EngineConfig, Transport};
use crate::process_manager::ManagerPair;
use crate::types::{ContractEvent, EngineContext, PendingTx};
use forge_protocol::proto::chain_rpc_server::{ChainRpc, ChainRpcServer};
use forge_protocol::{MsgType, TxMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

pub struct ChainRpcService {
    ctx: Arc<EngineContext>,
    managers: ManagerPair,
    /// Receiver side of `ctx.chain_tx`. Exactly one connection pumps it at
    /// a time; a reconnecting chain node takes it over.
    chain_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TxMessage>>>,
}

impl ChainRpcService {
    pub fn new(
        ctx: Arc<EngineContext>,
        managers: ManagerPair,
        chain_rx: mpsc::Receiver<TxMessage>,
    ) -> Self {
        Self {
            ctx,
            managers,
            chain_rx: Arc::new(tokio::sync::Mutex::new(chain_rx)),
        }
    }
}

#[tonic::async_trait]
impl ChainRpc for ChainRpcService {
    type ChainStreamStream = ReceiverStream<Result<TxMessage, Status>>;

    async fn chain_stream(
        &self,
        request: Request<Streaming<TxMessage>>,
    ) -> Result<Response<Self::ChainStreamStream>, Status> {
        println!("🔗 [CHAIN] chain node connected");
        let mut inbound = request.into_inner();
        let (out_tx, out_rx) = mpsc::channel::<Result<TxMessage, Status>>(1024);

        // Outbound pump. Holds the engine-wide receiver for as long as this
        // connection lives; releasing it on disconnect lets the chain's
        // next connection take over.
        let chain_rx = self.chain_rx.clone();
        tokio::spawn(async move {
            let mut rx = chain_rx.lock().await;
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if out_tx.send(Ok(msg)).await.is_err() {
                                // One message is lost with the connection;
                                // the chain retries the tx.
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = out_tx.closed() => break,
                }
            }
        });

        let ctx = self.ctx.clone();
        let managers = self.managers.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(msg)) => dispatch_chain_msg(&ctx, &managers, msg).await,
                    Ok(None) => {
                        println!("🔗 [CHAIN] chain node disconnected");
                        break;
                    }
                    Err(e) => {
                        eprintln!("⚠️ [CHAIN] stream error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

/// Route one inbound chain message to its component.
pub async fn dispatch_chain_msg(ctx: &Arc<EngineContext>, managers: &ManagerPair, msg: TxMessage) {
    match msg.msg_type() {
        MsgType::TxRequest => {
            ctx.scheduler.put_tx(PendingTx::new(msg)).await;
        }
        MsgType::GetBytecodeResponse => {
            if ctx
                .contract_tx
                .send(ContractEvent::GetContractResp { msg })
                .await
                .is_err()
            {
                eprintln!("❌ [CHAIN] contract manager unavailable");
            }
        }
        MsgType::GetStateResponse
        | MsgType::GetBatchStateResponse
        | MsgType::CallContractResponse
        | MsgType::CreateKvIteratorResponse
        | MsgType::ConsumeKvIteratorResponse
        | MsgType::CreateKeyHistoryIterResponse
        | MsgType::ConsumeKeyHistoryIterResponse
        | MsgType::GetSenderAddressResponse => {
            // Syscall response: back to the sandbox that asked.
            let name = msg.process_name().to_string();
            match managers.find_process(&name) {
                Some(process) => process.send_msg_to_sandbox(msg).await,
                // Sandbox died while the syscall was in flight.
                None => println!("⚙️ [CHAIN] no process {} for {:?}", name, msg.msg_type()),
            }
        }
        MsgType::Error if !msg.process_name().is_empty() => {
            let name = msg.process_name().to_string();
            if let Some(process) = managers.find_process(&name) {
                process.send_msg_to_sandbox(msg).await;
            }
        }
        other => {
            println!("⚙️ [CHAIN] dropped unexpected {:?}", other);
        }
    }
}

/// Bind a UNIX socket, replacing any stale file, and open its mode to 0777
/// so sandboxes running under their per-sandbox uids can connect.
pub(crate) fn bind_uds(path: &str) -> Result<tokio::net::UnixListener, String> {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::remove_file(path);
    let listener =
        tokio::net::UnixListener::bind(path).map_err(|e| format!("bind {}: {}", path, e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
        .map_err(|e| format!("chmod {}: {}", path, e))?;
    Ok(listener)
}

/// Bind and serve the chain-facing server. Runs until the process exits.
pub async fn serve_chain_rpc(
    cfg: Arc<EngineConfig>,
    ctx: Arc<EngineContext>,
    managers: ManagerPair,
    chain_rx: mpsc::Receiver<TxMessage>,
) -> Result<(), String> {
    let service = ChainRpcService::new(ctx, managers, chain_rx);
    let svc = ChainRpcServer::new(service)
        .max_decoding_message_size(cfg.max_recv_msg_size_mib as usize * 1024 * 1024)
        .max_encoding_message_size(cfg.max_send_msg_size_mib as usize * 1024 * 1024);
    let mut builder = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(cfg.keepalive_time_secs)))
        .http2_keepalive_timeout(Some(Duration::from_secs(cfg.keepalive_timeout_secs)));

    match cfg.transport {
        Transport::Uds => {
            let path = cfg.chain_sock_path();
            let listener = bind_uds(&path)?;
            println!("🚀 [CHAIN] serving on uds://{}", path);
            builder
                .add_service(svc)
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
                .map_err(|e| format!("chain rpc server: {}", e))
        }
        Transport::Tcp => {
            let addr = format!("0.0.0.0:{}", cfg.chain_rpc_port)
                .parse()
                .map_err(|e| format!("chain rpc addr: {}", e))?;
            println!("🚀 [CHAIN] serving on tcp://{}", addr);
            builder
                .add_service(svc)
                .serve(addr)
                .await
                .map_err(|e| format!("chain rpc server: {}", e))
        }
    }
}
