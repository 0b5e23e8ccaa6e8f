//! Per-connection subscription bookkeeping for a text transport.
//!
//! A transport (WebSocket, SSE, a test harness) owns one [`Connection`] per
//! client. Text frames go in through [`Connection::handle_text`]; envelopes
//! come out through the connection's sink. Dropping the connection revokes
//! every subscription it still holds.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::sink::Sink;
use super::subscription::{
    SubscribeRequest, SubscriptionError, SubscriptionFilter, SubscriptionHandle, SubscriptionId,
};
use super::Hub;

/// A text frame sent by a client.
///
/// ```json
/// {"type": "subscribe", "scope": "all", "topics": ["errors"]}
/// {"type": "unsubscribe", "subscription": 3}
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe { subscription: u64 },
}

/// Result of a handled client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientReply {
    Subscribed(SubscriptionHandle),
    Unsubscribed(SubscriptionId),
}

pub struct Connection {
    hub: Hub,
    sink: Arc<dyn Sink>,
    handles: Vec<SubscriptionHandle>,
}

impl Connection {
    pub fn new(hub: Hub, sink: Arc<dyn Sink>) -> Self {
        Self {
            hub,
            sink,
            handles: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, filter: SubscriptionFilter) -> SubscriptionHandle {
        let handle = self.hub.subscribe(filter, Arc::clone(&self.sink));
        self.handles.push(handle);
        handle
    }

    /// Parse and apply one client frame.
    ///
    /// A malformed frame is answered with a `rejected` envelope on this
    /// connection's sink; existing subscriptions are left alone.
    pub fn handle_text(&mut self, text: &str) -> Result<ClientReply, SubscriptionError> {
        match self.apply(text) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                warn!(error = %err, "client message rejected");
                self.sink.deliver(Envelope::rejected(err.to_string()));
                Err(err)
            }
        }
    }

    fn apply(&mut self, text: &str) -> Result<ClientReply, SubscriptionError> {
        let message: ClientMessage = serde_json::from_str(text)
            .map_err(|e| SubscriptionError::Malformed(e.to_string()))?;
        match message {
            ClientMessage::Subscribe(request) => {
                let filter = SubscriptionFilter::try_from(request)?;
                Ok(ClientReply::Subscribed(self.subscribe(filter)))
            }
            ClientMessage::Unsubscribe { subscription } => {
                let id = SubscriptionId(subscription);
                if self.unsubscribe(id) {
                    Ok(ClientReply::Unsubscribed(id))
                } else {
                    Err(SubscriptionError::UnknownSubscription(id))
                }
            }
        }
    }

    /// Revoke one of this connection's subscriptions.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(pos) = self.handles.iter().position(|h| h.id == id) else {
            return false;
        };
        let handle = self.handles.swap_remove(pos);
        self.hub.unsubscribe(&handle)
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.handles
    }

    /// Revoke every subscription. Idempotent.
    pub fn disconnect(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let count = self.handles.len();
        for handle in self.handles.drain(..) {
            self.hub.unsubscribe(&handle);
        }
        debug!(subscriptions = count, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
