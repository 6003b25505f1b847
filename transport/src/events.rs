use tokio::sync::broadcast;
use tracing::trace;

use crate::error::PacketError;
use crate::packet_header::MessageType;

/// Things that went wrong (or just happened) inside the transport's worker threads. They are not
///  propagated as errors since no caller is waiting for them; interested parties subscribe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    /// a received datagram was dropped without touching reassembly state
    PacketDropped(PacketError),
    /// partially received messages that were discarded after the reassembly timeout
    MessagesTimedOut {
        message_type: MessageType,
        count: usize,
    },
    SocketError(String),
    ReceiveLoopStopped,
}

#[derive(Clone)]
pub struct TransportEventNotifier {
    sender: broadcast::Sender<TransportEvent>,
}
impl TransportEventNotifier {
    pub fn new(capacity: usize) -> TransportEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        TransportEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: TransportEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_receives_events() {
        let notifier = TransportEventNotifier::new(4);
        let mut subscriber = notifier.subscribe();

        notifier.send_event(TransportEvent::PacketDropped(PacketError::Malformed(3)));
        notifier.send_event(TransportEvent::ReceiveLoopStopped);

        assert_eq!(subscriber.try_recv().unwrap(), TransportEvent::PacketDropped(PacketError::Malformed(3)));
        assert_eq!(subscriber.try_recv().unwrap(), TransportEvent::ReceiveLoopStopped);
        assert!(subscriber.try_recv().is_err());
    }

    #[test]
    fn test_send_without_subscribers() {
        let notifier = TransportEventNotifier::new(4);
        notifier.send_event(TransportEvent::SocketError("nobody listens".to_string()));
    }
}
