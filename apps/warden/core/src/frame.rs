use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::CorrelationId;

/// Method name of the cooperative shutdown request sent by the supervisor.
pub const STOP_ALL_METHOD: &str = "stop-all";

/// Event emitted by a child once everything it runs has stopped.
pub const ALL_STOPPED_EVENT: &str = "all-stopped";

/// Response payload returned to a stop request when the child had already stopped.
pub const ALREADY_STOPPED_PAYLOAD: &str = "already-stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Request,
    Response,
    Event,
}

/// Unit of exchange on the control channel, carried as a text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControlFrame {
    /// Builds a request with a fresh correlation id.
    pub fn request(method: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            id: Some(CorrelationId::generate()),
            kind: FrameKind::Request,
            method: Some(method.into()),
            payload,
        }
    }

    pub fn response(id: CorrelationId, payload: Option<Value>) -> Self {
        Self {
            id: Some(id),
            kind: FrameKind::Response,
            method: None,
            payload,
        }
    }

    pub fn event(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            id: None,
            kind: FrameKind::Event,
            method: Some(name.into()),
            payload,
        }
    }

    pub fn stop_all() -> Self {
        Self::request(STOP_ALL_METHOD, None)
    }

    pub fn all_stopped() -> Self {
        Self::event(ALL_STOPPED_EVENT, None)
    }

    pub fn already_stopped(id: CorrelationId) -> Self {
        Self::response(id, Some(already_stopped_payload()))
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: ControlFrame = serde_json::from_str(text).map_err(FrameError::Json)?;
        frame.validate()?;
        Ok(frame)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Json)
    }

    pub fn is_event(&self, name: &str) -> bool {
        self.kind == FrameKind::Event && self.method.as_deref() == Some(name)
    }

    pub fn is_already_stopped(&self) -> bool {
        self.kind == FrameKind::Response
            && self.payload.as_ref() == Some(&already_stopped_payload())
    }

    fn validate(&self) -> Result<(), FrameError> {
        match self.kind {
            FrameKind::Request if self.id.is_none() => Err(FrameError::MissingId(self.kind)),
            FrameKind::Response if self.id.is_none() => Err(FrameError::MissingId(self.kind)),
            FrameKind::Request | FrameKind::Event if self.method.is_none() => {
                Err(FrameError::MissingMethod(self.kind))
            }
            _ => Ok(()),
        }
    }
}

pub fn already_stopped_payload() -> Value {
    Value::String(ALREADY_STOPPED_PAYLOAD.to_owned())
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame json: {0}")]
    Json(serde_json::Error),
    #[error("{0:?} frame is missing its correlation id")]
    MissingId(FrameKind),
    #[error("{0:?} frame is missing its method name")]
    MissingMethod(FrameKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_omit_the_correlation_id() {
        let text = ControlFrame::event("tick", Some(json!({"n": 1})))
            .encode()
            .unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert!(raw.get("id").is_none());
        assert_eq!(raw["kind"], "event");
        assert_eq!(raw["method"], "tick");
    }

    #[test]
    fn responses_omit_the_method() {
        let id = CorrelationId::generate();
        let text = ControlFrame::response(id.clone(), None).encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["id"], id.as_str());
        assert!(raw.get("method").is_none());
        assert!(raw.get("payload").is_none());
    }

    #[test]
    fn decodes_frames_written_by_other_implementations() {
        let frame =
            ControlFrame::decode(r#"{"id":"ab12","kind":"response","payload":[1,2,3]}"#).unwrap();
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.id, Some(CorrelationId::from("ab12")));
        assert_eq!(frame.payload, Some(json!([1, 2, 3])));
    }

    #[test]
    fn rejects_structurally_invalid_frames() {
        assert!(matches!(
            ControlFrame::decode(r#"{"kind":"response"}"#),
            Err(FrameError::MissingId(FrameKind::Response))
        ));
        assert!(matches!(
            ControlFrame::decode(r#"{"id":"1","kind":"request"}"#),
            Err(FrameError::MissingMethod(FrameKind::Request))
        ));
        assert!(matches!(
            ControlFrame::decode("not json"),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            ControlFrame::decode(r#"{"kind":"telegram"}"#),
            Err(FrameError::Json(_))
        ));
    }

    #[test]
    fn recognises_stop_sentinels() {
        assert!(ControlFrame::all_stopped().is_event(ALL_STOPPED_EVENT));
        let id = CorrelationId::generate();
        assert!(ControlFrame::already_stopped(id.clone()).is_already_stopped());
        assert!(!ControlFrame::response(id, Some(json!("stopping"))).is_already_stopped());
    }
}
