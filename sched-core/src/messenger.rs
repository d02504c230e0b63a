//! Owner-facing observability: typed `Message` records for UI/operator
//! display, distinct from the developer-facing `tracing` instrumentation
//! scattered through the rest of the crate (see SPEC_FULL.md E.1.a).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Severity/kind of a [`Message`] (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Debug,
    Status,
    Warn,
    Error,
    Start,
    Success,
    Fail,
    /// An internal inconsistency the core detected in itself or a
    /// collaborator (e.g. the CAS helper exiting non-zero unexpectedly).
    Bug,
}

/// A single observability event, routed to whatever sink the owner
/// supplies via [`Messenger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Originating plugin, if this message was raised on behalf of one
    /// (spec §4.G); `None` for core-originated messages.
    pub plugin_id: Option<u64>,
    pub kind: MessageKind,
    pub brief: String,
    pub detail: Option<String>,
    #[serde(with = "duration_secs_opt")]
    pub elapsed: Option<Duration>,
}

impl Message {
    pub fn new(kind: MessageKind, brief: impl Into<String>) -> Self {
        Self {
            plugin_id: None,
            kind,
            brief: brief.into(),
            detail: None,
            elapsed: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn with_plugin(mut self, plugin_id: u64) -> Self {
        self.plugin_id = Some(plugin_id);
        self
    }

    pub fn bug(brief: impl Into<String>) -> Self {
        Self::new(MessageKind::Bug, brief)
    }

    pub fn warn(brief: impl Into<String>) -> Self {
        Self::new(MessageKind::Warn, brief)
    }
}

/// The owner-supplied sink for [`Message`] records (spec §6's
/// `context._message`).
pub trait Messenger: Send + Sync {
    fn message(&self, message: Message);
}

/// A [`Messenger`] that forwards every message to `tracing` at a level
/// matched to its [`MessageKind`], for owners who don't need a distinct
/// UI channel.
pub struct TracingMessenger;

impl Messenger for TracingMessenger {
    fn message(&self, message: Message) {
        match message.kind {
            MessageKind::Debug => tracing::debug!(brief = %message.brief, detail = ?message.detail, "message"),
            MessageKind::Status | MessageKind::Start | MessageKind::Success => {
                tracing::info!(brief = %message.brief, detail = ?message.detail, "message")
            }
            MessageKind::Warn => tracing::warn!(brief = %message.brief, detail = ?message.detail, "message"),
            MessageKind::Error | MessageKind::Fail | MessageKind::Bug => {
                tracing::error!(brief = %message.brief, detail = ?message.detail, "message")
            }
        }
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingMessenger {
        seen: Mutex<Vec<Message>>,
    }

    impl Messenger for RecordingMessenger {
        fn message(&self, message: Message) {
            self.seen.lock().unwrap().push(message);
        }
    }

    #[test]
    fn builder_methods_set_optional_fields() {
        let message = Message::new(MessageKind::Fail, "build failed")
            .with_detail("exit code 1")
            .with_elapsed(Duration::from_secs(3))
            .with_plugin(7);

        assert_eq!(message.plugin_id, Some(7));
        assert_eq!(message.detail.as_deref(), Some("exit code 1"));
        assert_eq!(message.elapsed, Some(Duration::from_secs(3)));
    }

    #[test]
    fn messenger_trait_is_object_safe_and_receives_messages() {
        let messenger = RecordingMessenger { seen: Mutex::new(Vec::new()) };
        let dyn_messenger: &dyn Messenger = &messenger;
        dyn_messenger.message(Message::bug("casd exited 137"));

        let seen = messenger.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MessageKind::Bug);
    }

    #[test]
    fn message_round_trips_through_json() {
        let message = Message::new(MessageKind::Status, "fetching").with_elapsed(Duration::from_millis(1500));
        let json = serde_json::to_string(&message).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.brief, "fetching");
        assert_eq!(restored.elapsed, Some(Duration::from_millis(1500)));
    }
}
