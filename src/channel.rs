use crate::dispatcher::SyncCore;
use crate::errors::{AppError, AppResult};
use crate::protocol::{GREETING, MAX_CONNECTION_REASON};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use uuid::Uuid;

pub const MAX_PEERS: usize = 1;
const PEER_QUEUE: usize = 256;

#[derive(Debug, Clone)]
struct PeerHandle {
    peer_id: String,
    sender: mpsc::Sender<String>,
}

#[derive(Debug)]
pub enum Admission {
    Accepted {
        peer_id: String,
        receiver: mpsc::Receiver<String>,
    },
    Rejected,
}

/// Open channel peers in connection order.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<Mutex<Vec<PeerHandle>>>,
    max_peers: usize,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(MAX_PEERS)
    }
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: Arc::new(Mutex::new(Vec::new())),
            max_peers,
        }
    }

    pub async fn admit(&self) -> Admission {
        let mut peers = self.peers.lock().await;
        peers.retain(|peer| !peer.sender.is_closed());
        if peers.len() >= self.max_peers {
            return Admission::Rejected;
        }
        let peer_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel::<String>(PEER_QUEUE);
        peers.push(PeerHandle {
            peer_id: peer_id.clone(),
            sender,
        });
        Admission::Accepted { peer_id, receiver }
    }

    pub async fn remove(&self, peer_id: &str) {
        let mut peers = self.peers.lock().await;
        peers.retain(|peer| peer.peer_id != peer_id);
    }

    pub async fn open_count(&self) -> usize {
        let peers = self.peers.lock().await;
        peers.iter().filter(|peer| !peer.sender.is_closed()).count()
    }

    /// Sends to every open peer. Fails with `NoChannel` when none is open.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> AppResult<usize> {
        let text = serde_json::to_string(message).map_err(|error| AppError::Internal(error.to_string()))?;
        let senders = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .filter(|peer| !peer.sender.is_closed())
                .map(|peer| peer.sender.clone())
                .collect::<Vec<_>>()
        };
        if senders.is_empty() {
            return Err(AppError::NoChannel);
        }

        let mut delivered = 0usize;
        for sender in senders {
            if sender.send(text.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(AppError::NoChannel);
        }
        Ok(delivered)
    }

    pub async fn send_first<T: Serialize + ?Sized>(&self, message: &T) -> AppResult<()> {
        let text = serde_json::to_string(message).map_err(|error| AppError::Internal(error.to_string()))?;
        let sender = {
            let peers = self.peers.lock().await;
            peers
                .iter()
                .find(|peer| !peer.sender.is_closed())
                .map(|peer| peer.sender.clone())
        };
        let Some(sender) = sender else {
            return Err(AppError::NoChannel);
        };
        sender.send(text).await.map_err(|_| AppError::NoChannel)
    }

    /// Drops every peer's queue; their connections close once drained.
    pub async fn close_all(&self) {
        let mut peers = self.peers.lock().await;
        peers.clear();
    }
}

/// Accepts channel peers until `shutdown` flips to true.
pub async fn serve_channel(
    listener: TcpListener,
    core: Arc<SyncCore>,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, address) = accepted.map_err(|error| AppError::Transport(error.to_string()))?;
                tracing::debug!(peer = %address, "channel connection");
                tokio::spawn(handle_connection(stream, core.clone()));
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    core.peers().close_all().await;
    Ok(())
}

async fn handle_connection(stream: TcpStream, core: Arc<SyncCore>) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::warn!(error = %error, "channel handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = socket.split();
    if !core.is_running() {
        tracing::debug!("service stopped, dropping channel connection");
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let (peer_id, mut receiver) = match core.peers().admit().await {
        Admission::Accepted { peer_id, receiver } => (peer_id, receiver),
        Admission::Rejected => {
            tracing::info!("rejecting channel peer, limit reached");
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: Utf8Bytes::from_static(MAX_CONNECTION_REASON),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    if let Err(error) = sink.send(Message::text(GREETING.to_string())).await {
        tracing::warn!(peer_id = %peer_id, error = %error, "channel greeting failed");
        core.peers().remove(&peer_id).await;
        return;
    }
    tracing::info!(peer_id = %peer_id, "channel peer connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = receiver.recv().await {
            if sink.send(Message::text(text)).await.is_err() {
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => core.handle_channel_message(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(peer_id = %peer_id, error = %error, "channel read failed");
                break;
            }
        }
    }

    core.peers().remove(&peer_id).await;
    writer.abort();
    tracing::info!(peer_id = %peer_id, "channel peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn second_peer_is_rejected_while_first_is_open() {
        let registry = PeerRegistry::new(1);
        let first = registry.admit().await;
        assert!(matches!(first, Admission::Accepted { .. }));
        assert!(matches!(registry.admit().await, Admission::Rejected));
        assert_eq!(registry.open_count().await, 1);

        if let Admission::Accepted { peer_id, .. } = first {
            registry.remove(&peer_id).await;
        }
        assert!(matches!(registry.admit().await, Admission::Accepted { .. }));
    }

    #[tokio::test]
    async fn broadcast_without_peers_reports_no_channel() {
        let registry = PeerRegistry::default();
        let error = registry.broadcast(&json!({"a": 1})).await.expect_err("no peers");
        assert!(matches!(error, AppError::NoChannel));
        assert!(matches!(registry.send_first(&json!({})).await, Err(AppError::NoChannel)));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_open_peer() {
        let registry = PeerRegistry::new(2);
        let Admission::Accepted { receiver: mut first, .. } = registry.admit().await else {
            panic!("first peer rejected");
        };
        let Admission::Accepted { receiver: mut second, .. } = registry.admit().await else {
            panic!("second peer rejected");
        };

        let delivered = registry.broadcast(&json!({"liveupdate": true})).await.expect("broadcast");
        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await.as_deref(), Some(r#"{"liveupdate":true}"#));
        assert_eq!(second.recv().await.as_deref(), Some(r#"{"liveupdate":true}"#));

        registry.send_first(&json!({"n": 1})).await.expect("send first");
        assert_eq!(first.recv().await.as_deref(), Some(r#"{"n":1}"#));
        assert!(second.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_frees_the_slot() {
        let registry = PeerRegistry::new(1);
        let Admission::Accepted { receiver, .. } = registry.admit().await else {
            panic!("peer rejected");
        };
        drop(receiver);
        assert_eq!(registry.open_count().await, 0);
        assert!(matches!(registry.admit().await, Admission::Accepted { .. }));
    }
}
