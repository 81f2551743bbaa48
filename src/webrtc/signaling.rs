//! Signalling protocol messages
//!
//! JSON messages exchanged with the signalling server over WebSocket. Every
//! message carries a `type` field.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use super::config::RtcConfiguration;

/// Remote viewer id, as assigned by the signalling server
///
/// The server may send it as a JSON string or number; it is always sent back
/// as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ConnectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum StringOrNumber {
            String(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match StringOrNumber::deserialize(deserializer)? {
            StringOrNumber::String(s) => Self(s),
            StringOrNumber::Unsigned(n) => Self(n.to_string()),
            StringOrNumber::Signed(n) => Self(n.to_string()),
        })
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Messages from the signalling server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "config")]
    Config {
        #[serde(rename = "peerConnectionOptions", default)]
        peer_connection_options: RtcConfiguration,
    },
    #[serde(rename = "offer")]
    Offer {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
        sdp: String,
    },
    #[serde(rename = "iceCandidate")]
    IceCandidate {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
        candidate: IceCandidate,
    },
    #[serde(rename = "playerConnected")]
    PlayerConnected {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
        #[serde(rename = "dataChannel", default)]
        data_channel: bool,
        #[serde(default)]
        sfu: bool,
    },
    #[serde(rename = "playerDisconnected")]
    PlayerDisconnected {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
    },
    #[serde(rename = "identify")]
    Identify,
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        time: Option<i64>,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        time: Option<i64>,
    },
    /// Anything this streamer does not handle
    #[serde(other)]
    Unknown,
}

/// Messages to the signalling server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "endpointId")]
    EndpointId { id: String },
    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
        sdp: String,
    },
    #[serde(rename = "iceCandidate")]
    IceCandidate {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
        candidate: IceCandidate,
    },
    #[serde(rename = "disconnectPlayer")]
    DisconnectPlayer {
        #[serde(rename = "playerId")]
        player_id: ConnectionId,
        reason: String,
    },
    #[serde(rename = "ping")]
    Ping { time: i64 },
    #[serde(rename = "pong")]
    Pong { time: i64 },
}

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_string_or_number() {
        let a: ServerMessage =
            serde_json::from_str(r#"{"type":"offer","playerId":"101","sdp":"v=0"}"#).unwrap();
        let b: ServerMessage =
            serde_json::from_str(r#"{"type":"offer","playerId":101,"sdp":"v=0"}"#).unwrap();
        assert_eq!(a, b);
        match a {
            ServerMessage::Offer { player_id, sdp } => {
                assert_eq!(player_id.as_str(), "101");
                assert_eq!(sdp, "v=0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_config_message() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"config","peerConnectionOptions":{"iceServers":[{"urls":"stun:stun.example.org:19302"}]}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Config {
                peer_connection_options,
            } => {
                assert_eq!(
                    peer_connection_options.ice_servers[0].urls,
                    vec!["stun:stun.example.org:19302".to_string()]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ice_candidate_message() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"iceCandidate","playerId":7,"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::IceCandidate { player_id, candidate } => {
                assert_eq!(player_id, ConnectionId::from("7"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_bare_messages() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"streamerList"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"identify"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Identify);
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ping","time":5}"#).unwrap();
        assert_eq!(msg, ServerMessage::Ping { time: Some(5) });
    }

    #[test]
    fn test_client_messages() {
        let answer = ClientMessage::Answer {
            player_id: ConnectionId::from("3"),
            sdp: "v=0".to_string(),
        };
        let value = serde_json::to_value(&answer).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["playerId"], "3");

        let disconnect = ClientMessage::DisconnectPlayer {
            player_id: ConnectionId::from("3"),
            reason: "failed".to_string(),
        };
        let value = serde_json::to_value(&disconnect).unwrap();
        assert_eq!(value["type"], "disconnectPlayer");
        assert_eq!(value["reason"], "failed");

        let id = serde_json::to_value(ClientMessage::EndpointId { id: "S".into() }).unwrap();
        assert_eq!(id, serde_json::json!({"type": "endpointId", "id": "S"}));
    }
}
