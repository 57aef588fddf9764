//! Payload decoding and downstream request construction.
//!
//! The active [`EnvelopeMode`] is fixed per deployment:
//! - `Raw`: the payload is posted verbatim to the base URL.
//! - `ResourceId`: the payload is a JSON object; its `resource_id` is appended
//!   to the base URL as one path segment and the request has no body.

use reqwest::Url;
use serde_json::Value;

use relay_common::error::RelayError;
use relay_common::types::EnvelopeMode;

/// JSON field carrying the routing key in `ResourceId` mode.
pub const RESOURCE_ID_FIELD: &str = "resource_id";

/// A decoded message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Raw(Vec<u8>),
    Routed { resource_id: String },
}

/// A fully resolved downstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRequest {
    pub url: Url,
    /// Raw body, sent as `application/json`. `None` means an empty POST.
    pub body: Option<Vec<u8>>,
}

impl Envelope {
    /// Decode a payload according to the deployment's mode.
    pub fn decode(mode: EnvelopeMode, payload: &[u8]) -> Result<Self, RelayError> {
        match mode {
            EnvelopeMode::Raw => Ok(Envelope::Raw(payload.to_vec())),
            EnvelopeMode::ResourceId => {
                let value: Value = serde_json::from_slice(payload)
                    .map_err(|e| RelayError::Decode(format!("payload is not valid JSON: {e}")))?;

                let object = value.as_object().ok_or_else(|| {
                    RelayError::Decode("payload is not a JSON object".to_string())
                })?;

                let resource_id = match object.get(RESOURCE_ID_FIELD) {
                    Some(Value::String(id)) => id.trim(),
                    Some(_) => {
                        return Err(RelayError::Decode(format!(
                            "{RESOURCE_ID_FIELD} must be a string"
                        )));
                    }
                    None => {
                        return Err(RelayError::Decode(format!(
                            "payload is missing {RESOURCE_ID_FIELD}"
                        )));
                    }
                };

                if resource_id.is_empty() {
                    return Err(RelayError::Decode(format!("{RESOURCE_ID_FIELD} is empty")));
                }

                // URL path resolution drops dot segments, which would post to
                // the base URL without the routing key.
                if matches!(resource_id, "." | "..") {
                    return Err(RelayError::Decode(format!(
                        "{RESOURCE_ID_FIELD} '{resource_id}' is not a valid path segment"
                    )));
                }

                Ok(Envelope::Routed {
                    resource_id: resource_id.to_string(),
                })
            }
        }
    }

    /// Routing key, if this envelope carries one.
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Envelope::Raw(_) => None,
            Envelope::Routed { resource_id } => Some(resource_id),
        }
    }

    /// Resolve the downstream request against the configured base URL.
    pub fn into_request(self, base_url: &Url) -> Result<TargetRequest, RelayError> {
        match self {
            Envelope::Raw(body) => Ok(TargetRequest {
                url: base_url.clone(),
                body: Some(body),
            }),
            Envelope::Routed { resource_id } => {
                let mut url = base_url.clone();
                url.path_segments_mut()
                    .map_err(|_| {
                        RelayError::Config(format!("base URL {base_url} cannot take a path"))
                    })?
                    .pop_if_empty()
                    .push(&resource_id);

                Ok(TargetRequest { url, body: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn test_raw_payload_is_forwarded_verbatim() {
        let payload = br#"{"foo":"bar"}"#;
        let envelope = Envelope::decode(EnvelopeMode::Raw, payload).unwrap();
        assert_eq!(envelope.resource_id(), None);

        let request = envelope.into_request(&base("http://svc/inbound")).unwrap();
        assert_eq!(request.url.as_str(), "http://svc/inbound");
        assert_eq!(request.body.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn test_raw_mode_accepts_non_json() {
        let envelope = Envelope::decode(EnvelopeMode::Raw, b"\x00\xffnot json").unwrap();
        assert_eq!(envelope, Envelope::Raw(b"\x00\xffnot json".to_vec()));
    }

    #[test]
    fn test_resource_id_is_appended_as_path_segment() {
        let envelope =
            Envelope::decode(EnvelopeMode::ResourceId, br#"{"resource_id":"abc123"}"#).unwrap();
        assert_eq!(envelope.resource_id(), Some("abc123"));

        let request = envelope.into_request(&base("http://svc")).unwrap();
        assert_eq!(request.url.as_str(), "http://svc/abc123");
        assert!(request.body.is_none());
    }

    #[test]
    fn test_resource_id_with_base_path_and_trailing_slash() {
        let envelope =
            Envelope::decode(EnvelopeMode::ResourceId, br#"{"resource_id":"abc123"}"#).unwrap();
        let request = envelope
            .into_request(&base("https://svc/api/email/send/"))
            .unwrap();
        assert_eq!(request.url.as_str(), "https://svc/api/email/send/abc123");
    }

    #[test]
    fn test_resource_id_is_percent_encoded() {
        let envelope =
            Envelope::decode(EnvelopeMode::ResourceId, br#"{"resource_id":"a/b c"}"#).unwrap();
        let request = envelope.into_request(&base("http://svc")).unwrap();
        assert_eq!(request.url.as_str(), "http://svc/a%2Fb%20c");
    }

    #[test]
    fn test_dotted_resource_id_keeps_its_segment() {
        let envelope =
            Envelope::decode(EnvelopeMode::ResourceId, br#"{"resource_id":"..a"}"#).unwrap();
        let request = envelope.into_request(&base("http://svc/api/send")).unwrap();
        assert_eq!(request.url.as_str(), "http://svc/api/send/..a");
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let envelope = Envelope::decode(
            EnvelopeMode::ResourceId,
            br#"{"resource_id":"abc123","container":"emails"}"#,
        )
        .unwrap();
        assert_eq!(envelope.resource_id(), Some("abc123"));
    }

    #[test]
    fn test_missing_resource_id_is_decode_error() {
        let err = Envelope::decode(EnvelopeMode::ResourceId, b"{}").unwrap_err();
        assert!(matches!(err, RelayError::Decode(_)));
        assert!(err.to_string().contains("resource_id"));
    }

    #[test]
    fn test_non_json_is_decode_error() {
        let err = Envelope::decode(EnvelopeMode::ResourceId, b"abc123").unwrap_err();
        assert!(matches!(err, RelayError::Decode(_)));
    }

    #[test]
    fn test_non_object_is_decode_error() {
        for payload in [&br#"["abc123"]"#[..], b"\"abc123\"", b"42"] {
            let err = Envelope::decode(EnvelopeMode::ResourceId, payload).unwrap_err();
            assert!(matches!(err, RelayError::Decode(_)));
        }
    }

    #[test]
    fn test_empty_or_non_string_resource_id_is_decode_error() {
        for payload in [
            &br#"{"resource_id":""}"#[..],
            br#"{"resource_id":"   "}"#,
            br#"{"resource_id":42}"#,
            br#"{"resource_id":null}"#,
            br#"{"resource_id":"."}"#,
            br#"{"resource_id":".."}"#,
            br#"{"resource_id":" .. "}"#,
        ] {
            let err = Envelope::decode(EnvelopeMode::ResourceId, payload).unwrap_err();
            assert!(matches!(err, RelayError::Decode(_)), "payload {payload:?}");
        }
    }
}
