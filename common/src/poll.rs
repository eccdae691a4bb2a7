use serde_json::Value;
use thiserror::Error;

use crate::types::ApplianceState;

pub const STATE_ON: &str = "on";
pub const MAX_STATE_BODY_BYTES: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("unparseable state body: {0}")]
    Parse(String),
    #[error("station link is down")]
    LinkDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReply {
    pub status: u16,
    pub body: String,
}

impl StateReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

pub trait StatePoller {
    fn fetch(&mut self, url: &str) -> Result<StateReply, PollError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePoller;

impl StatePoller for OfflinePoller {
    fn fetch(&mut self, _url: &str) -> Result<StateReply, PollError> {
        Err(PollError::LinkDown)
    }
}

pub fn state_url(api_base: &str, appliance_id: &str) -> String {
    format!("{}/{}/state", api_base.trim_end_matches('/'), appliance_id)
}

// Only an exact `"state": "on"` member of a JSON object means on.
pub fn parse_state_body(body: &str) -> Result<ApplianceState, PollError> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| PollError::Parse(err.to_string()))?;
    let report = value
        .as_object()
        .ok_or_else(|| PollError::Parse("state body is not a JSON object".to_string()))?;

    match report.get("state") {
        Some(Value::String(state)) if state == STATE_ON => Ok(ApplianceState::On),
        Some(Value::String(_)) | Some(Value::Null) | None => Ok(ApplianceState::Off),
        Some(other) => Err(PollError::Parse(format!("`state` is not a string: {other}"))),
    }
}

pub fn interpret_reply(reply: &StateReply) -> Result<ApplianceState, PollError> {
    if !(200..300).contains(&reply.status) {
        return Err(PollError::Status(reply.status));
    }
    if reply.body.len() > MAX_STATE_BODY_BYTES {
        return Err(PollError::Parse(format!(
            "body of {} bytes exceeds limit",
            reply.body.len()
        )));
    }
    parse_state_body(&reply.body)
}

pub fn poll_appliance<P>(poller: &mut P, url: &str) -> Result<ApplianceState, PollError>
where
    P: StatePoller + ?Sized,
{
    let reply = poller.fetch(url)?;
    interpret_reply(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_state_url() {
        assert_eq!(
            state_url("http://10.0.0.2:3000/appliances/", "AC1"),
            "http://10.0.0.2:3000/appliances/AC1/state"
        );
        assert_eq!(
            state_url("http://host/appliances", "AC1"),
            "http://host/appliances/AC1/state"
        );
    }

    #[test]
    fn recognizes_on_token() {
        let body = r#"{"success":true,"uid":"AC1","state":"on","uptime":12}"#;
        assert_eq!(parse_state_body(body), Ok(ApplianceState::On));

        let spaced = r#"{ "state" : "on" }"#;
        assert_eq!(parse_state_body(spaced), Ok(ApplianceState::On));
    }

    #[test]
    fn everything_else_is_off() {
        for body in [
            r#"{"state":"off"}"#,
            r#"{"state":"ON"}"#,
            r#"{"state":"standby"}"#,
            r#"{"state":null}"#,
            r#"{"uid":"AC1"}"#,
        ] {
            assert_eq!(parse_state_body(body), Ok(ApplianceState::Off), "{body}");
        }
    }

    #[test]
    fn malformed_body_is_parse_error() {
        assert!(matches!(
            parse_state_body("\"state\":\"on\""),
            Err(PollError::Parse(_))
        ));
        assert!(matches!(
            parse_state_body(r#"{"state":1}"#),
            Err(PollError::Parse(_))
        ));
        assert!(matches!(parse_state_body(""), Err(PollError::Parse(_))));
    }

    #[test]
    fn non_object_body_is_parse_error() {
        for body in [r#"["on"]"#, r#""on""#, "[null]", r#"[{"state":"on"}]"#, "null"] {
            assert!(
                matches!(
                    interpret_reply(&StateReply::new(200, body)),
                    Err(PollError::Parse(_))
                ),
                "{body}"
            );
        }
    }

    #[test]
    fn non_success_status_is_status_error() {
        let reply = StateReply::new(500, r#"{"state":"on"}"#);
        assert_eq!(interpret_reply(&reply), Err(PollError::Status(500)));

        let reply = StateReply::new(404, r#"{"error":"Appliance not found"}"#);
        assert_eq!(interpret_reply(&reply), Err(PollError::Status(404)));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let padding = "x".repeat(MAX_STATE_BODY_BYTES);
        let body = format!(r#"{{"state":"on","pad":"{padding}"}}"#);
        assert!(matches!(
            interpret_reply(&StateReply::new(200, body)),
            Err(PollError::Parse(_))
        ));
    }
}
