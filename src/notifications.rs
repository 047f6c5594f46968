//! Cluster notifications
//!
//! Peer nodes coordinate through `{command, payload, signature}` messages
//! on a shared channel. Locally the channel is a tokio broadcast; a
//! cluster transport bridges it to the wire.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Recognized cluster commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    ApiUpdated,
    ApiRemoved,
    ApiAdded,
    GroupReload,
    KeySpaceUpdate,
    OAuthRevokeToken,
    OAuthRevokeAllTokens,
    OAuthRevokeRefresh,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub command: Command,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub signature: String,
}

impl Notification {
    pub fn new(command: Command, payload: impl Into<String>) -> Self {
        Self {
            command,
            payload: payload.into(),
            signature: String::new(),
        }
    }
}

/// Publishes notifications to every subscriber; lagging subscribers drop
/// the oldest messages.
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn notify(&self, notification: Notification) {
        tracing::debug!(command = ?notification.command, "Publishing notification");
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_subscribers() {
        let notifier = Notifier::new();
        let mut rx1 = notifier.subscribe();
        let mut rx2 = notifier.subscribe();

        notifier.notify(Notification::new(Command::GroupReload, ""));

        assert_eq!(rx1.recv().await.unwrap().command, Command::GroupReload);
        assert_eq!(rx2.recv().await.unwrap().command, Command::GroupReload);
    }

    #[test]
    fn test_notify_without_subscribers_is_fine() {
        let notifier = Notifier::new();
        notifier.notify(Notification::new(Command::ApiAdded, "api-1"));
    }

    #[test]
    fn test_wire_format() {
        let notification = Notification::new(Command::OAuthRevokeAllTokens, "client-1");
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["command"], "OAuthRevokeAllTokens");
        assert_eq!(json["payload"], "client-1");
        assert_eq!(json["signature"], "");

        let parsed: Notification =
            serde_json::from_str(r#"{"command":"GroupReload","payload":"","signature":"sig"}"#)
                .unwrap();
        assert_eq!(parsed.command, Command::GroupReload);
        assert_eq!(parsed.signature, "sig");
    }

    #[test]
    fn test_unknown_command_tolerated() {
        let parsed: Notification =
            serde_json::from_str(r#"{"command":"SomethingNew","payload":""}"#).unwrap();
        assert_eq!(parsed.command, Command::Unknown);
    }
}
