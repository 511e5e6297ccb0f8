use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// User identity = opaque string assigned by the account system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Author-generated id for an optimistic local write.  The id is final:
    /// the remote record created on confirmation carries the same one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation shape, derived from the participant count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationKind {
    OneToOne,
    Group,
}

impl ConversationKind {
    pub fn from_participant_count(count: usize) -> Self {
        if count > 2 {
            Self::Group
        } else {
            Self::OneToOne
        }
    }
}

/// Delivery lifecycle of a message.
///
/// Transitions are monotonic along `Sending -> Sent -> Delivered -> Read`,
/// with `Sending -> Failed` on delivery error and `Failed -> Sending` when a
/// retry is started.  `Sent -> Delivered` is only ever triggered by an
/// external delivery confirmation; nothing inside the engine produces it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Sending)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Delivered, Read)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown message status: {0}")]
pub struct ParseStatusError(pub String);

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = ParseMediaKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            other => Err(ParseMediaKindError(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown media kind: {0}")]
pub struct ParseMediaKindError(pub String);

/// Descriptor for media carried by a message.  Upload and transcoding are
/// external concerns; the engine only replicates the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub url: String,
    /// Playback length in seconds, for audio and video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// Last known online state of a peer.  Ephemeral: rebuilt from the remote
/// presence subscription, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_participant_count() {
        assert_eq!(
            ConversationKind::from_participant_count(2),
            ConversationKind::OneToOne
        );
        assert_eq!(
            ConversationKind::from_participant_count(3),
            ConversationKind::Group
        );
    }

    #[test]
    fn status_transitions() {
        use MessageStatus::*;

        // The happy path is monotonic.
        assert!(Sending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Sent.can_transition_to(Read));

        // Failure and the explicit retry loop.
        assert!(Sending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Sending));

        // No going backwards.
        assert!(!Sent.can_transition_to(Sending));
        assert!(!Read.can_transition_to(Sent));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Sent));

        // Failed is terminal until a retry restarts it.
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Failed.can_transition_to(Read));
    }

    #[test]
    fn status_round_trip() {
        for status in [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn generated_message_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }
}
