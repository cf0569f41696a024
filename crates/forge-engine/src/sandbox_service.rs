// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FORGE - SANDBOX RPC SERVICE
//
// The engine's south side: one duplex stream per sandbox process. The
// first inbound message must be REGISTER naming the process; everything
// after is tx responses and syscalls, forwarded to the Process record.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use crate::config::{EngineConfig, Transport};
use crate::process_manager::ManagerPair;
use forge_protocol::proto::sandbox_rpc_server::{SandboxRpc, SandboxRpcServer};
use forge_protocol::{MsgType, TxMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

pub struct SandboxRpcService {
    managers: ManagerPair,
}

impl SandboxRpcService {
    pub fn new(managers: ManagerPair) -> Self {
        Self { managers }
    }
}

/// The stream's opening handshake: REGISTER carrying the process name the
/// engine assigned at spawn (argv).
pub fn registered_name(first: &TxMessage) -> Result<String, Status> {
    if first.msg_type() != MsgType::Register {
        return Err(Status::invalid_argument(format!(
            "first sandbox message must be REGISTER, got {:?}",
            first.msg_type()
        )));
    }
    let name = first.process_name();
    if name.is_empty() {
        return Err(Status::invalid_argument(
            "REGISTER without a process name",
        ));
    }
    Ok(name.to_string())
}

#[tonic::async_trait]
impl SandboxRpc for SandboxRpcService {
    type SandboxStreamStream = ReceiverStream<Result<TxMessage, Status>>;

    async fn sandbox_stream(
        &self,
        request: Request<Streaming<TxMessage>>,
    ) -> Result<Response<Self::SandboxStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty sandbox stream"))?;
        let name = registered_name(&first)?;

        let Some(process) = self.managers.find_process(&name) else {
            // A sandbox the engine no longer tracks (killed while dialing).
            return Err(Status::not_found(format!("unknown process {}", name)));
        };

        let (out_tx, out_rx) = mpsc::channel::<Result<TxMessage, Status>>(64);
        let (stream_tx, mut stream_rx) = mpsc::channel::<TxMessage>(64);
        process
            .set_stream(stream_tx)
            .map_err(Status::internal)?;
        println!("🔌 [SANDBOX] {} registered", name);

        tokio::spawn(async move {
            while let Some(msg) = stream_rx.recv().await {
                if out_tx.send(Ok(msg)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(msg)) => process.put_sandbox_msg(msg).await,
                    Ok(None) => break,
                    Err(e) => {
                        // The OS process exit is tracked separately; a
                        // broken stream here is routine teardown.
                        println!("🔌 [SANDBOX] {} stream closed: {}", process.name(), e);
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

/// Bind and serve the sandbox-facing server. Runs until the process exits.
pub async fn serve_sandbox_rpc(cfg: Arc<EngineConfig>, managers: ManagerPair) -> Result<(), String> {
    let svc = SandboxRpcServer::new(SandboxRpcService::new(managers))
        .max_decoding_message_size(cfg.max_recv_msg_size_mib as usize * 1024 * 1024)
        .max_encoding_message_size(cfg.max_send_msg_size_mib as usize * 1024 * 1024);
    let mut builder = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(cfg.keepalive_time_secs)))
        .http2_keepalive_timeout(Some(Duration::from_secs(cfg.keepalive_timeout_secs)));

    match cfg.transport {
        Transport::Uds => {
            let path = cfg.sandbox_sock_path();
            let listener = crate::chain_service::bind_uds(&path)?;
            println!("🚀 [SANDBOX] serving on uds://{}", path);
            builder
                .add_service(svc)
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
                .map_err(|e| format!("sandbox rpc server: {}", e))
        }
        Transport::Tcp => {
            let addr = format!("127.0.0.1:{}", cfg.sandbox_rpc_port)
                .parse()
                .map_err(|e| format!("sandbox rpc addr: {}", e))?;
            println!("🚀 [SANDBOX] serving on tcp://{}", addr);
            builder
                .add_service(svc)
                .serve(addr)
                .await
                .map_err(|e| format!("sandbox rpc server: {}", e))
        }
    }
}
