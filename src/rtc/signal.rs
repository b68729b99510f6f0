//! Signaling messages
//!
//! SDP offers/answers and trickled ICE candidates exchanged between the
//! capture endpoint, the relay and viewers over the HTTP long-poll channel.

use super::RtcError;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Kind of negotiation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// A single negotiation message.
///
/// `viewer_id` is empty for traffic between the relay and the capture
/// endpoint in relayed mode. In direct-connect mode the relay stamps it with
/// the posting viewer's id so the capture endpoint can address its reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    #[serde(default)]
    pub viewer_id: String,

    #[serde(rename = "type")]
    pub kind: SignalKind,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sdp: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
}

impl Signal {
    /// Create an offer message
    pub fn offer(viewer_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            kind: SignalKind::Offer,
            sdp: sdp.into(),
            candidate: None,
        }
    }

    /// Create an answer message
    pub fn answer(viewer_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            kind: SignalKind::Answer,
            sdp: sdp.into(),
            candidate: None,
        }
    }

    /// Create an ICE candidate message
    pub fn candidate(viewer_id: impl Into<String>, candidate: RTCIceCandidateInit) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            kind: SignalKind::Candidate,
            sdp: String::new(),
            candidate: Some(candidate),
        }
    }

    /// Return a copy addressed to `viewer_id`
    pub fn stamped(mut self, viewer_id: &str) -> Self {
        self.viewer_id = viewer_id.to_string();
        self
    }

    /// Parse a batch of messages from a JSON array
    pub fn batch_from_json(json: &str) -> Result<Vec<Self>, RtcError> {
        serde_json::from_str(json)
            .map_err(|e| RtcError::Sdp(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, RtcError> {
        serde_json::to_string(self)
            .map_err(|e| RtcError::Sdp(format!("Failed to serialize message: {}", e)))
    }
}
