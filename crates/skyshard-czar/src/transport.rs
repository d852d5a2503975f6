//! Czar-side worker channels
//!
//! One framed TCP connection per worker carries task dispatch, cancels and
//! the multiplexed reply streams coming back. Inbound frames from every
//! worker funnel into a single event queue; a router forwards them to the
//! owning query's executor. Socket-level failures are retried once with a
//! fresh connection before surfacing as transport errors.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use skyshard_common::QueryId;
use skyshard_config::TransportConfig;
use skyshard_proto::{ErrorMsg, FrameCodec, Message, ReplyBlob, ReplyHeader, StatusMsg};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{CzarError, CzarResult};

/// Anything a worker can tell the czar, tagged with its origin address.
#[derive(Debug)]
pub enum WorkerEvent {
    Header(ReplyHeader),
    Blob(ReplyBlob),
    Status(StatusMsg),
    Error(ErrorMsg),
    /// The channel to a worker dropped; jobs in flight there are suspect.
    ChannelClosed { addr: String },
}

impl WorkerEvent {
    /// The user query this event belongs to, if any.
    pub fn query_id(&self) -> Option<QueryId> {
        match self {
            Self::Header(h) => Some(h.query_id),
            Self::Blob(b) => Some(b.query_id),
            Self::Status(s) => Some(s.query_id),
            Self::Error(e) => Some(e.query_id),
            Self::ChannelClosed { .. } => None,
        }
    }
}

/// Pool of framed channels keyed by worker address.
pub struct WorkerChannelPool {
    config: TransportConfig,
    channels: DashMap<String, mpsc::Sender<Message>>,
    events_tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerChannelPool {
    pub fn new(config: TransportConfig, events_tx: mpsc::Sender<WorkerEvent>) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: DashMap::new(),
            events_tx,
        })
    }

    /// Send one message to a worker, reconnecting once on a dead channel.
    ///
    /// # Errors
    /// `Transport` once the retry has been spent.
    pub async fn send(&self, addr: &str, message: Message) -> CzarResult<()> {
        let first = self.channel(addr).await?;
        match first.send(message.clone()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                // The writer task died with the socket. Retry once on a
                // fresh connection before giving up.
                debug!(addr, "channel dead, reconnecting once");
                self.channels.remove(addr);
                let second = self.channel(addr).await?;
                second
                    .send(message)
                    .await
                    .map_err(|_| CzarError::Transport(format!("worker channel to {addr} closed")))
            }
        }
    }

    async fn channel(&self, addr: &str) -> CzarResult<mpsc::Sender<Message>> {
        if let Some(existing) = self.channels.get(addr) {
            return Ok(existing.clone());
        }
        let tx = self.connect(addr).await?;
        self.channels.insert(addr.to_string(), tx.clone());
        Ok(tx)
    }

    async fn connect(&self, addr: &str) -> CzarResult<mpsc::Sender<Message>> {
        let timeout = Duration::from_secs(self.config.connect_timeout_seconds);
        let socket = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CzarError::Timeout(format!("connecting to worker {addr}")))?
            .map_err(|e| CzarError::Transport(format!("connect {addr}: {e}")))?;
        debug!(addr, "worker channel established");

        let framed = Framed::new(socket, FrameCodec::new(self.config.max_frame_bytes));
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    warn!(error = %err, "worker channel write failed");
                    break;
                }
            }
        });

        let events = self.events_tx.clone();
        let event_addr = addr.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let event = match frame {
                    Ok(Message::ReplyHeader(h)) => WorkerEvent::Header(h),
                    Ok(Message::ReplyBlob(b)) => WorkerEvent::Blob(b),
                    Ok(Message::Status(s)) => WorkerEvent::Status(s),
                    Ok(Message::Error(e)) => WorkerEvent::Error(e),
                    Ok(other) => {
                        warn!(tag = other.tag(), "unexpected frame from worker");
                        continue;
                    }
                    Err(err) => {
                        warn!(error = %err, "worker channel read failed");
                        break;
                    }
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events
                .send(WorkerEvent::ChannelClosed { addr: event_addr })
                .await;
        });

        Ok(tx)
    }
}
