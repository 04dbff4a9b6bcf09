//! Notification payload construction.
//!
//! Produces the compact JSON blob carried by every frame of a batch: an
//! `aps` dictionary plus any custom top-level keys.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::push::frame::check_payload_size;

/// Sound played when none is requested.
pub const DEFAULT_SOUND: &str = "chime";

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Alert<'a> {
    Text(&'a str),
    Localized(LocalizedAlert<'a>),
}

#[derive(Debug, Serialize)]
struct LocalizedAlert<'a> {
    body: &'a str,
    #[serde(rename = "action-loc-key", skip_serializing_if = "Option::is_none")]
    action_loc_key: Option<&'a str>,
    #[serde(rename = "loc-key", skip_serializing_if = "Option::is_none")]
    loc_key: Option<&'a str>,
    #[serde(rename = "loc-args", skip_serializing_if = "no_args")]
    loc_args: &'a [String],
}

fn no_args(args: &&[String]) -> bool {
    args.is_empty()
}

#[derive(Debug, Serialize)]
struct Aps<'a> {
    alert: Alert<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
    #[serde(rename = "content-available", skip_serializing_if = "Option::is_none")]
    content_available: Option<u8>,
}

/// Builder for a notification payload.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    alert: String,
    badge: u32,
    sound: String,
    content_available: bool,
    action_loc_key: Option<String>,
    loc_key: Option<String>,
    loc_args: Vec<String>,
    custom: Map<String, Value>,
}

impl PayloadBuilder {
    pub fn new(alert: impl Into<String>) -> Self {
        Self {
            alert: alert.into(),
            badge: 0,
            sound: DEFAULT_SOUND.to_string(),
            content_available: false,
            action_loc_key: None,
            loc_key: None,
            loc_args: Vec::new(),
            custom: Map::new(),
        }
    }

    /// Badge number; 0 leaves the badge out.
    pub fn badge(mut self, badge: u32) -> Self {
        self.badge = badge;
        self
    }

    /// Sound name; empty leaves the sound out.
    pub fn sound(mut self, sound: impl Into<String>) -> Self {
        self.sound = sound.into();
        self
    }

    pub fn content_available(mut self, enabled: bool) -> Self {
        self.content_available = enabled;
        self
    }

    pub fn action_loc_key(mut self, key: impl Into<String>) -> Self {
        self.action_loc_key = Some(key.into());
        self
    }

    pub fn loc_key(mut self, key: impl Into<String>) -> Self {
        self.loc_key = Some(key.into());
        self
    }

    pub fn loc_args(mut self, args: Vec<String>) -> Self {
        self.loc_args = args;
        self
    }

    /// Custom top-level keys. An `aps` key here is replaced.
    pub fn custom(mut self, custom: Map<String, Value>) -> Self {
        self.custom = custom;
        self
    }

    fn is_localized(&self) -> bool {
        self.action_loc_key.is_some() || self.loc_key.is_some() || !self.loc_args.is_empty()
    }

    /// Serialize as compact UTF-8 JSON, rejecting payloads the gateway would drop.
    pub fn build(&self) -> Result<Bytes> {
        let alert = if self.is_localized() {
            Alert::Localized(LocalizedAlert {
                body: &self.alert,
                action_loc_key: self.action_loc_key.as_deref(),
                loc_key: self.loc_key.as_deref(),
                loc_args: &self.loc_args,
            })
        } else {
            Alert::Text(&self.alert)
        };

        let aps = Aps {
            alert,
            badge: (self.badge != 0).then_some(self.badge),
            sound: (!self.sound.is_empty()).then_some(self.sound.as_str()),
            content_available: self.content_available.then_some(1),
        };

        let mut root = self.custom.clone();
        root.insert("aps".to_string(), serde_json::to_value(&aps)?);

        let encoded = serde_json::to_vec(&Value::Object(root))?;
        check_payload_size(encoded.len())?;
        Ok(Bytes::from(encoded))
    }
}

/// Parse custom payload keys given as a JSON object.
pub fn parse_custom(json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(json)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidInput(format!(
            "custom payload must be a JSON object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_plain_alert() {
        let payload = PayloadBuilder::new("Hello").build().unwrap();
        assert_eq!(
            parse(&payload),
            json!({"aps": {"alert": "Hello", "sound": "chime"}})
        );
    }

    #[test]
    fn test_output_is_compact() {
        let payload = PayloadBuilder::new("Hi").sound("").build().unwrap();
        assert_eq!(&payload[..], br#"{"aps":{"alert":"Hi"}}"#);
    }

    #[test]
    fn test_badge_and_content_available() {
        let payload = PayloadBuilder::new("Hi")
            .badge(3)
            .content_available(true)
            .build()
            .unwrap();
        assert_eq!(
            parse(&payload),
            json!({"aps": {"alert": "Hi", "badge": 3, "sound": "chime", "content-available": 1}})
        );
    }

    #[test]
    fn test_zero_badge_omitted() {
        let payload = PayloadBuilder::new("Hi").badge(0).build().unwrap();
        assert!(parse(&payload)["aps"].get("badge").is_none());
    }

    #[test]
    fn test_localized_alert() {
        let payload = PayloadBuilder::new("Body")
            .action_loc_key("VIEW")
            .loc_key("GAME_INVITE")
            .loc_args(vec!["Jenna".to_string(), "Frank".to_string()])
            .build()
            .unwrap();
        assert_eq!(
            parse(&payload)["aps"]["alert"],
            json!({
                "body": "Body",
                "action-loc-key": "VIEW",
                "loc-key": "GAME_INVITE",
                "loc-args": ["Jenna", "Frank"]
            })
        );
    }

    #[test]
    fn test_loc_args_alone_makes_alert_an_object() {
        let payload = PayloadBuilder::new("Body")
            .loc_args(vec!["x".to_string()])
            .build()
            .unwrap();
        assert_eq!(
            parse(&payload)["aps"]["alert"],
            json!({"body": "Body", "loc-args": ["x"]})
        );
    }

    #[test]
    fn test_custom_keys_merged_and_aps_wins() {
        let custom = parse_custom(r#"{"thread": 42, "aps": "ignored"}"#).unwrap();
        let payload = PayloadBuilder::new("Hi").custom(custom).build().unwrap();
        let value = parse(&payload);
        assert_eq!(value["thread"], json!(42));
        assert_eq!(value["aps"]["alert"], json!("Hi"));
    }

    #[test]
    fn test_non_ascii_kept_as_utf8() {
        let payload = PayloadBuilder::new("héllo").sound("").build().unwrap();
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"aps":{"alert":"héllo"}}"#
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let result = PayloadBuilder::new("x".repeat(300)).build();
        assert!(matches!(result, Err(Error::PayloadTooLarge { max: 256, .. })));
    }

    #[test]
    fn test_parse_custom_rejects_non_object() {
        assert!(matches!(parse_custom("[1, 2]"), Err(Error::InvalidInput(_))));
        assert!(matches!(parse_custom("{"), Err(Error::Json(_))));
    }
}
