//! Raw TCP frontend connector.

use super::{FrontendConnector, FrontendKind, ListenerHandle, bind_address};
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::PipelineStages;
use crate::processor::{catch_panic, panic_message};
use async_trait::async_trait;
use esgate_kernel::pipeline::{Metadata, Payload, ProcessResult, keys};
use futures::FutureExt;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Serves one accepted connection.
///
/// `stages` are the processors and backends of the pipeline that declared the
/// connector. Implementations should return once `shutdown` is cancelled and
/// no message is being processed.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle_connection(
        &self,
        stream: TcpStream,
        stages: Arc<PipelineStages>,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// LineConnectionHandler
// ─────────────────────────────────────────────────────────────────────────────

/// Newline-delimited protocol: every line is one message, answered with the
/// processor chain's output on its own line.
pub struct LineConnectionHandler;

#[async_trait]
impl ConnectionHandler for LineConnectionHandler {
    async fn handle_connection(
        &self,
        stream: TcpStream,
        stages: Arc<PipelineStages>,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let peer = stream.peer_addr().ok();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let request_id = Uuid::new_v4().to_string();
            let mut metadata = Metadata::new();
            metadata.set(keys::REQUEST_ID, &request_id);
            if let Some(peer) = peer {
                metadata.set("remote_addr", &peer.to_string());
            }
            let message = ProcessResult::new(metadata, Payload::text(line));

            let mut reply = match catch_panic(stages.process(&request_id, message)).await {
                Ok(result) => result.payload.to_bytes().unwrap_or_default(),
                Err(e) => {
                    warn!(request_id = %request_id, pipeline = %stages.name(), error = %e, "TCP message failed");
                    format!("error: {e}").into_bytes()
                }
            };
            if !reply.ends_with(b"\n") {
                reply.push(b'\n');
            }
            writer.write_all(&reply).await?;
        }
        writer.shutdown().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TcpFrontendConnector
// ─────────────────────────────────────────────────────────────────────────────

pub struct TcpFrontendConnector {
    endpoint: String,
    handler: Arc<dyn ConnectionHandler>,
    stages: Option<Arc<PipelineStages>>,
    running: Mutex<Option<ListenerHandle>>,
}

impl TcpFrontendConnector {
    pub fn new(endpoint: impl Into<String>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            endpoint: endpoint.into(),
            handler,
            stages: None,
            running: Mutex::new(None),
        }
    }

    pub(crate) fn bind_stages(&mut self, stages: &Arc<PipelineStages>) {
        if self.stages.is_none() {
            self.stages = Some(Arc::clone(stages));
        }
    }
}

async fn accept_loop(
    endpoint: String,
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    stages: Arc<PipelineStages>,
    token: CancellationToken,
) {
    let connections = TaskTracker::new();
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(endpoint = %endpoint, peer = %peer, "TCP connection accepted");
                let handler = Arc::clone(&handler);
                let stages = Arc::clone(&stages);
                let shutdown = token.child_token();
                let endpoint = endpoint.clone();
                connections.spawn(async move {
                    let served = AssertUnwindSafe(handler.handle_connection(stream, stages, shutdown))
                        .catch_unwind()
                        .await;
                    match served {
                        Ok(Ok(())) => debug!(endpoint = %endpoint, peer = %peer, "TCP connection closed"),
                        Ok(Err(e)) => warn!(endpoint = %endpoint, peer = %peer, error = %e, "TCP connection failed"),
                        Err(panic) => error!(
                            endpoint = %endpoint,
                            peer = %peer,
                            panic = %panic_message(panic.as_ref()),
                            "TCP connection handler panicked"
                        ),
                    }
                });
            }
            Err(e) => warn!(endpoint = %endpoint, error = %e, "failed to accept TCP connection"),
        }
    }
    connections.close();
    connections.wait().await;
}

#[async_trait]
impl FrontendConnector for TcpFrontendConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn kind(&self) -> FrontendKind {
        FrontendKind::Tcp
    }

    fn handler_count(&self) -> usize {
        1
    }

    fn middleware_count(&self) -> usize {
        0
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|h| h.local_addr)
    }

    async fn listen(&self) -> GatewayResult<()> {
        if self.running.lock().is_some() {
            return Err(GatewayError::AlreadyRunning(self.endpoint.clone()));
        }
        let stages = self.stages.clone().ok_or_else(|| {
            GatewayError::Internal(format!("TCP connector '{}' has no pipeline bound", self.endpoint))
        })?;
        let bind_err = |source| GatewayError::Bind {
            endpoint: self.endpoint.clone(),
            source,
        };
        let listener = TcpListener::bind(bind_address(&self.endpoint))
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(GatewayError::AlreadyRunning(self.endpoint.clone()));
        }
        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            self.endpoint.clone(),
            listener,
            Arc::clone(&self.handler),
            stages,
            token.clone(),
        ));
        info!(endpoint = %self.endpoint, local_addr = %local_addr, "TCP frontend listening");
        *running = Some(ListenerHandle {
            token,
            task,
            local_addr,
        });
        Ok(())
    }

    async fn stop(&self, deadline: Duration) -> GatewayResult<()> {
        let handle = self
            .running
            .lock()
            .take()
            .ok_or_else(|| GatewayError::NotRunning(self.endpoint.clone()))?;
        info!(endpoint = %self.endpoint, "stopping TCP frontend");
        handle.shutdown(&self.endpoint, deadline).await
    }
}
