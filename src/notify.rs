//! Notification dispatch seam.
//!
//! Actual push delivery lives outside this service. The dispatcher stores
//! the opener on the user document; the next open-chat connection surfaces
//! it as the assistant's first message instead of generating one.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::store::ChatStore;

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, uid: &str, message: &str) -> Result<()>;
}

/// Default dispatcher: records the pending opener and logs in place of a
/// real push provider.
pub struct LoggingDispatcher {
    store: Arc<ChatStore>,
}

impl LoggingDispatcher {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationDispatcher for LoggingDispatcher {
    async fn notify(&self, uid: &str, message: &str) -> Result<()> {
        self.store.set_pending_message(uid, message)?;
        tracing::info!("Notification queued for {}: {}", uid, message);
        Ok(())
    }
}
