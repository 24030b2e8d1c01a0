//! Client transport seam.
//!
//! The session layer pushes JSON frames at a uid; the WebSocket plumbing
//! behind [`ConnectionManager`] decides where they go. A send to a user with
//! no open connection is dropped with a warning rather than treated as an
//! error, so a mid-turn disconnect cannot abort the turn.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, uid: &str, payload: Value) -> Result<()>;
}

#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<String, mpsc::Sender<Value>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection's outbound channel. A previous connection for
    /// the same uid is dropped, which ends its writer task and closes the
    /// old socket.
    pub async fn connect(&self, uid: &str, sender: mpsc::Sender<Value>) {
        let mut connections = self.connections.lock().await;
        if connections.insert(uid.to_string(), sender).is_some() {
            tracing::info!("Replacing existing connection for {}", uid);
        }
    }

    /// Removes the connection if `sender` is still the registered one; a
    /// reconnect that already replaced it is left alone.
    pub async fn disconnect(&self, uid: &str, sender: &mpsc::Sender<Value>) {
        let mut connections = self.connections.lock().await;
        if let Some(current) = connections.get(uid) {
            if current.same_channel(sender) {
                connections.remove(uid);
            }
        }
    }

    pub async fn is_connected(&self, uid: &str) -> bool {
        self.connections.lock().await.contains_key(uid)
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn send(&self, uid: &str, payload: Value) -> Result<()> {
        let sender = {
            let connections = self.connections.lock().await;
            connections.get(uid).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(payload).await.is_err() {
                    tracing::warn!("Connection for {} closed mid-send", uid);
                }
            }
            None => {
                tracing::warn!("Dropping frame for {}: no open connection", uid);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_reaches_the_registered_connection() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::channel(8);
        manager.connect("u1", tx).await;
        manager.send("u1", json!({"type": "closing"})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()["type"], json!("closing"));
    }

    #[tokio::test]
    async fn reconnect_replaces_the_previous_channel() {
        let manager = ConnectionManager::new();
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (new_tx, mut new_rx) = mpsc::channel(8);
        manager.connect("u1", old_tx.clone()).await;
        manager.connect("u1", new_tx).await;

        manager.send("u1", json!({"n": 1})).await.unwrap();
        assert!(new_rx.try_recv().is_ok());
        assert!(old_rx.try_recv().is_err());

        // The old connection's teardown must not evict the new one.
        manager.disconnect("u1", &old_tx).await;
        assert!(manager.is_connected("u1").await);
    }

    #[tokio::test]
    async fn send_without_a_connection_is_not_an_error() {
        let manager = ConnectionManager::new();
        assert!(manager.send("ghost", json!({})).await.is_ok());
    }
}
