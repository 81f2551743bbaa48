//! Streamer event types
//!
//! Everything the application layer can observe about the streaming
//! subsystem. The fan-out path never returns errors past the streamer; it
//! publishes these instead.

use serde::{Deserialize, Serialize};

/// Events broadcast through the [`EventBus`](super::EventBus)
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamerEvent {
    // ============================================================================
    // Signalling
    // ============================================================================
    /// Connected to the signalling server
    #[serde(rename = "signalling.connected")]
    SignallingConnected { url: String },

    /// Lost the signalling server; every session has been torn down
    #[serde(rename = "signalling.disconnected")]
    SignallingDisconnected { reason: String },

    // ============================================================================
    // Sessions
    // ============================================================================
    /// A viewer session was created from an offer
    #[serde(rename = "session.created")]
    SessionCreated {
        connection_id: String,
        quality_controller: bool,
        session_count: usize,
    },

    /// A viewer session was removed
    #[serde(rename = "session.closed")]
    SessionClosed {
        connection_id: String,
        session_count: usize,
    },

    /// Quality control moved to another viewer
    #[serde(rename = "session.quality_controller")]
    QualityControllerChanged { connection_id: String },

    /// The last viewer left; the streamer is idle
    #[serde(rename = "session.all_closed")]
    AllConnectionsClosed,

    // ============================================================================
    // Viewer input
    // ============================================================================
    /// UI interaction descriptor sent by a viewer
    #[serde(rename = "input.ui_interaction")]
    UiInteraction {
        connection_id: String,
        descriptor: String,
    },

    /// Console command descriptor sent by a viewer
    #[serde(rename = "input.command")]
    Command {
        connection_id: String,
        descriptor: String,
    },

    /// Raw input event (keyboard, mouse, touch, gamepad) for the application
    #[serde(rename = "input.event")]
    InputEvent {
        connection_id: String,
        message_type: u8,
        payload: Vec<u8>,
    },

    // ============================================================================
    // Diagnostics
    // ============================================================================
    /// Latency probe finished; `results` is the JSON sent to the viewer
    #[serde(rename = "stats.latency_test")]
    LatencyTestCompleted {
        connection_id: String,
        results: String,
    },
}

impl StreamerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SignallingConnected { .. } => "signalling.connected",
            Self::SignallingDisconnected { .. } => "signalling.disconnected",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionClosed { .. } => "session.closed",
            Self::QualityControllerChanged { .. } => "session.quality_controller",
            Self::AllConnectionsClosed => "session.all_closed",
            Self::UiInteraction { .. } => "input.ui_interaction",
            Self::Command { .. } => "input.command",
            Self::InputEvent { .. } => "input.event",
            Self::LatencyTestCompleted { .. } => "stats.latency_test",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_uses_event_name() {
        let event = StreamerEvent::SessionCreated {
            connection_id: "101".into(),
            quality_controller: true,
            session_count: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.event_name());
        assert_eq!(json["data"]["connection_id"], "101");

        let idle = serde_json::to_value(StreamerEvent::AllConnectionsClosed).unwrap();
        assert_eq!(idle["event"], "session.all_closed");
    }
}
