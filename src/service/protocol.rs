use crate::common::time::{self, Timestamp};
use crate::common::{FaceGateError, Result};
use crate::core::Recognition;
use serde::{Deserialize, Deserializer, Serialize};

pub const NO_PERSON: &str = "N/A";
pub const CONNECTED_MESSAGE: &str = "Connected to face recognition status server";

/// Camera-declared intent for the next photo.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Add,
    /// Recognition; also what any unrecognised purpose string means.
    #[default]
    #[serde(other)]
    Check,
}

/// Text frame sent by the camera ahead of each photo.
///
/// Only a non-object frame is rejected. Field values of the wrong type fall
/// back to their defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionHeader {
    #[serde(default, deserialize_with = "lenient_purpose")]
    pub purpose: Purpose,
    /// Declared payload size. Informational only, never checked.
    #[serde(default, deserialize_with = "lenient_length", skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl SessionHeader {
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| FaceGateError::Protocol(format!("Invalid header: {}", e)))?;
        if !value.is_object() {
            return Err(FaceGateError::Protocol(
                "Invalid header: expected a JSON object".to_string()
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| FaceGateError::Protocol(format!("Invalid header: {}", e)))
    }
}

fn lenient_purpose<'de, D>(deserializer: D) -> std::result::Result<Purpose, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value.as_str() {
        Some("add") => Purpose::Add,
        _ => Purpose::Check,
    })
}

fn lenient_length<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(serde_json::Value::deserialize(deserializer)?.as_u64())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Connected,
    Added,
    Granted,
    Denied,
    Error,
}

/// Reply to the camera for one frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PhotoResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PhotoResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            person: None,
            message: Some(message.into()),
        }
    }

    pub fn added(person: impl Into<String>) -> Self {
        Self {
            status: Status::Added,
            person: Some(person.into()),
            message: None,
        }
    }

    /// Recognition replies always carry both `person` and `message`.
    pub fn recognition(result: Recognition) -> Self {
        let (status, person, message) = match result {
            Recognition::Granted { person } => (Status::Granted, person, String::new()),
            Recognition::Denied => (Status::Denied, NO_PERSON.to_string(), String::new()),
            Recognition::Error { message } => (Status::Error, NO_PERSON.to_string(), message),
        };
        Self {
            status,
            person: Some(person),
            message: Some(message),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event pushed to every dashboard.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl StatusEvent {
    pub fn connected(at: &Timestamp) -> Self {
        Self {
            status: Status::Connected,
            person: None,
            message: Some(CONNECTED_MESSAGE.to_string()),
            timestamp: time::iso(at),
        }
    }

    pub fn error(message: impl Into<String>, at: &Timestamp) -> Self {
        Self {
            status: Status::Error,
            person: None,
            message: Some(message.into()),
            timestamp: time::iso(at),
        }
    }

    /// Event mirroring a processed submission's reply.
    pub fn outcome(response: &PhotoResponse, at: &Timestamp) -> Self {
        Self {
            status: response.status,
            person: Some(response.person.clone().unwrap_or_else(|| NO_PERSON.to_string())),
            message: Some(response.message.clone().unwrap_or_default()),
            timestamp: time::iso(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_defaults_missing_fields() {
        let header = SessionHeader::parse("{}").unwrap();
        assert_eq!(header.purpose, Purpose::Check);
        assert_eq!(header.length, None);
    }

    #[test]
    fn header_reads_purpose_and_length() {
        let header = SessionHeader::parse(r#"{"purpose":"add","length":12345}"#).unwrap();
        assert_eq!(header.purpose, Purpose::Add);
        assert_eq!(header.length, Some(12345));
    }

    #[test]
    fn wrong_typed_length_is_ignored() {
        for length in [r#""12345""#, "-1", "12345.0", "null", "[]"] {
            let text = format!(r#"{{"purpose":"add","length":{}}}"#, length);
            let header = SessionHeader::parse(&text).unwrap();
            assert_eq!(header.purpose, Purpose::Add, "length {}", length);
            assert_eq!(header.length, None, "length {}", length);
        }
    }

    #[test]
    fn null_or_non_string_purpose_means_check() {
        let header = SessionHeader::parse(r#"{"purpose":null,"length":3}"#).unwrap();
        assert_eq!(header.purpose, Purpose::Check);
        assert_eq!(header.length, Some(3));

        let header = SessionHeader::parse(r#"{"purpose":7}"#).unwrap();
        assert_eq!(header.purpose, Purpose::Check);
    }

    #[test]
    fn purpose_serde_round_trips_known_and_unknown_names() {
        assert_eq!(serde_json::from_str::<Purpose>(r#""add""#).unwrap(), Purpose::Add);
        assert_eq!(serde_json::from_str::<Purpose>(r#""verify""#).unwrap(), Purpose::Check);
        assert_eq!(serde_json::to_string(&Purpose::Check).unwrap(), r#""check""#);
    }

    #[test]
    fn unknown_purpose_means_check() {
        let header = SessionHeader::parse(r#"{"purpose":"verify"}"#).unwrap();
        assert_eq!(header.purpose, Purpose::Check);
    }

    #[test]
    fn malformed_header_is_protocol_error() {
        assert!(matches!(
            SessionHeader::parse("{not json"),
            Err(FaceGateError::Protocol(_))
        ));
        assert!(SessionHeader::parse(r#"["add", 5]"#).is_err());
        assert!(SessionHeader::parse(r#""add""#).is_err());
    }

    #[test]
    fn error_reply_omits_person() {
        let value = serde_json::to_value(PhotoResponse::error("No faces detected in the image")).unwrap();
        assert_eq!(value, json!({"status": "error", "message": "No faces detected in the image"}));
    }

    #[test]
    fn recognition_reply_fills_defaults() {
        let denied = serde_json::to_value(PhotoResponse::recognition(Recognition::Denied)).unwrap();
        assert_eq!(denied, json!({"status": "denied", "person": "N/A", "message": ""}));

        let granted = PhotoResponse::recognition(Recognition::Granted { person: "alice".into() });
        assert_eq!(granted.person.as_deref(), Some("alice"));
    }

    #[test]
    fn outcome_event_mirrors_reply() {
        let at = time::now();
        let event = StatusEvent::outcome(&PhotoResponse::added("user_20250301_140211"), &at);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "added");
        assert_eq!(value["person"], "user_20250301_140211");
        assert_eq!(value["message"], "");
        assert_eq!(value["timestamp"], time::iso(&at));
    }
}
