use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::id::ClientToken;

/// Delivery target of an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every live connection held under one client token
    Client(ClientToken),
    /// Every live connection, regardless of token
    Broadcast,
}

/// A message queued for real-time delivery.
///
/// Immutable once created; the payload is refcounted so fanning one
/// message out to many connections never copies the bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub recipient: Recipient,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(recipient: Recipient, payload: impl Into<Bytes>) -> Self {
        Self {
            recipient,
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    /// Message addressed to all connections of one client token
    #[must_use]
    pub fn to_client(token: ClientToken, payload: impl Into<Bytes>) -> Self {
        Self::new(Recipient::Client(token), payload)
    }

    /// Message addressed to every connected client
    #[must_use]
    pub fn broadcast(payload: impl Into<Bytes>) -> Self {
        Self::new(Recipient::Broadcast, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_payload() {
        let message = OutboundMessage::broadcast(vec![1u8, 2, 3]);
        let copy = message.clone();

        assert_eq!(message.payload, copy.payload);
        assert_eq!(message.created_at, copy.created_at);
    }

    #[test]
    fn test_recipient_constructors() {
        let token = ClientToken::from("CqdAJ3vM8hTq");
        let targeted = OutboundMessage::to_client(token.clone(), "hi");
        assert_eq!(targeted.recipient, Recipient::Client(token));

        let broadcast = OutboundMessage::broadcast("hi");
        assert_eq!(broadcast.recipient, Recipient::Broadcast);
    }
}
