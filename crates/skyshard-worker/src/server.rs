//! Framed TCP server for the czar channel
//!
//! One connection carries every message kind. Inbound frames go to the
//! dispatcher; outbound frames funnel through a per-connection writer task
//! so reply streams from many executor loops interleave without tearing
//! frames. Budget permits attached to blob frames are released as the
//! writer drains them.

use futures::{SinkExt, StreamExt};
use skyshard_proto::FrameCodec;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::dispatcher::WorkerDispatcher;
use crate::error::WorkerResult;
use crate::send_channel::Outbound;
use crate::service::ServiceContext;

/// Frames queued per connection before producers start blocking.
const WRITER_QUEUE_DEPTH: usize = 256;

/// Accept loop for czar connections.
pub struct WorkerServer {
    ctx: Arc<ServiceContext>,
}

impl WorkerServer {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Serve connections until the listener fails.
    ///
    /// # Errors
    /// Returns the listener's IO error; per-connection errors only end that
    /// connection.
    pub async fn run(&self, listener: TcpListener) -> WorkerResult<()> {
        info!(addr = ?listener.local_addr().ok(), "worker transport listening");
        loop {
            let (socket, peer) = listener
                .accept()
                .await
                .map_err(skyshard_proto::ProtoError::from)?;
            debug!(%peer, "czar connected");
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                handle_connection(ctx, socket).await;
                debug!(%peer, "czar connection closed");
            });
        }
    }
}

async fn handle_connection(ctx: Arc<ServiceContext>, socket: TcpStream) {
    let max_frame = ctx.config.transport.max_frame_bytes;
    let framed = Framed::new(socket, FrameCodec::new(max_frame));
    let (mut sink, mut stream) = framed.split();

    let (tx, mut rx) = mpsc::channel::<Outbound>(WRITER_QUEUE_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            if let Err(err) = sink.send(outbound.message).await {
                warn!(error = %err, "connection write failed");
                break;
            }
            // `outbound` drops here, releasing its reply-budget permit.
        }
    });

    let dispatcher = WorkerDispatcher::new(Arc::clone(&ctx));
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(message) => dispatcher.handle(message, &tx).await,
            Err(err) => {
                warn!(error = %err, "connection read failed");
                break;
            }
        }
    }
    drop(tx);
    let _ = writer.await;
}

/// Announce this worker to the registry so czars can discover it. Failure
/// is tolerated: a worker can serve already-connected czars without it.
pub async fn register_with_registry(ctx: &Arc<ServiceContext>) {
    let registry = &ctx.config.registry;
    let payload = serde_json::json!({
        "name": ctx.config.name,
        "port": ctx.config.transport.worker_port,
    });
    let url = format!("{}/worker", registry.url.trim_end_matches('/'));
    match reqwest::Client::new().post(&url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {
            info!(url, "registered with worker registry");
        }
        Ok(response) => {
            warn!(url, status = %response.status(), "registry rejected registration");
        }
        Err(err) => {
            warn!(url, error = %err, "registry unreachable, continuing unregistered");
        }
    }
}
