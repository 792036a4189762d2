use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::dto::session::{OptionCount, SegmentView, SessionSnapshot, VoteRoundView};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE event name; `None` sends an unnamed message.
    pub event: Option<String>,
    /// Serialised JSON payload.
    pub data: String,
}

impl ServerEvent {
    /// Construct an event from already serialised data.
    pub fn new(event: Option<String>, data: String) -> Self {
        Self { event, data }
    }

    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// Whether this event carries the given name.
    pub fn is(&self, name: &str) -> bool {
        self.event.as_deref() == Some(name)
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Session the stream is bound to.
    pub session_id: Uuid,
    /// Human-readable message confirming the subscription.
    pub message: String,
    /// Whether the backend is running without a storage backend connection.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the backend enters or leaves degraded mode.
pub struct SystemStatus {
    /// Current degraded flag.
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
/// A new segment was appended and, normally, a new round opened.
pub struct SegmentPublishedEvent {
    /// Session the event belongs to.
    pub session_id: Uuid,
    /// Epoch the segment was appended in.
    pub epoch: u64,
    /// The appended segment.
    pub segment: SegmentView,
    /// Round opened for it; `None` for an ending segment.
    pub vote_round: Option<VoteRoundView>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Best-effort live tally of the open round.
pub struct VoteTallyUpdatedEvent {
    /// Session the event belongs to.
    pub session_id: Uuid,
    /// Round being counted.
    pub round_id: Uuid,
    /// Votes per option, ordered like the options.
    pub counts: Vec<OptionCount>,
    /// Votes that named one of the options.
    pub total_votes: u32,
}

#[derive(Debug, Serialize, ToSchema)]
/// The session was restarted; clients should drop their cached history.
pub struct SessionRestartedEvent {
    /// Snapshot of the restarted session.
    pub session: SessionSnapshot,
}

/// The session was completed; no further events follow.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionCompletedEvent {
    /// Session the event belongs to.
    pub session_id: Uuid,
}
