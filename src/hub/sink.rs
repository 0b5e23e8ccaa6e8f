//! Non-blocking per-subscriber delivery.
//!
//! The hub never waits on a subscriber. A sink either accepts the envelope
//! immediately, refuses it because its backlog is full, or reports that the
//! other end is gone. What happens to a full backlog is the transport's call.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Backlog full; the envelope was dropped for this subscriber only.
    Full,
    /// Receiver gone; the hub removes the subscription.
    Closed,
}

/// Delivery capability for one connection. Must not block.
pub trait Sink: Send + Sync + 'static {
    fn deliver(&self, envelope: Envelope) -> Delivery;
}

impl Sink for mpsc::Sender<Envelope> {
    fn deliver(&self, envelope: Envelope) -> Delivery {
        match self.try_send(envelope) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

impl Sink for mpsc::UnboundedSender<Envelope> {
    fn deliver(&self, envelope: Envelope) -> Delivery {
        match self.send(envelope) {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        }
    }
}

/// Adapts a callback into a sink. The callback runs on the publishing task.
pub struct CallbackSink<F>(pub F);

impl<F> Sink for CallbackSink<F>
where
    F: Fn(Envelope) -> Delivery + Send + Sync + 'static,
{
    fn deliver(&self, envelope: Envelope) -> Delivery {
        (self.0)(envelope)
    }
}
