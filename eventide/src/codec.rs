//! Event payload encoding.
//!
//! The core never looks inside a payload. It asks an [`EventCodec`] to turn
//! typed values into the raw representation a backend stores (and back), and
//! keeps the logical event name next to the payload itself.
use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Converts typed events and snapshot states to and from a raw payload.
pub trait EventCodec: Send + Sync + 'static {
    /// The raw representation understood by the backends paired with this
    /// codec.
    type Raw: Clone + Debug + Send + Sync + 'static;

    /// MIME type describing [`Self::Raw`].
    fn content_type(&self) -> &'static str;

    /// Encodes a value.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Self::Raw>;

    /// Decodes a payload recorded under `event_name` into `T`.
    ///
    /// Fails with [`Error::Decode`] when the payload cannot become a `T`.
    fn decode<T: DeserializeOwned>(&self, raw: &Self::Raw, event_name: &str) -> Result<T>;
}

/// JSON codec storing payloads as UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EventCodec for JsonCodec {
    type Raw = Vec<u8>;

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Self::Raw> {
        serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, raw: &Self::Raw, event_name: &str) -> Result<T> {
        serde_json::from_slice(raw).map_err(|e| Error::Decode {
            event_name: event_name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// JSON codec storing payloads as strings, for backends with text columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStringCodec;

impl EventCodec for JsonStringCodec {
    type Raw = String;

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Self::Raw> {
        serde_json::to_string(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, raw: &Self::Raw, event_name: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(|e| Error::Decode {
            event_name: event_name.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Renamed {
        from: String,
        to: String,
    }

    #[test]
    fn json_codec_reports_decode_failures_with_the_event_name() {
        let err = JsonCodec
            .decode::<Renamed>(&b"{\"from\": 1}".to_vec(), "Renamed")
            .expect_err("payload has the wrong shape");
        match err {
            Error::Decode { event_name, .. } => assert_eq!(event_name, "Renamed"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn both_codecs_produce_json() {
        assert_eq!(JsonCodec.content_type(), "application/json");
        assert_eq!(JsonStringCodec.content_type(), JsonCodec.content_type());
    }

    #[test]
    fn string_codec_decodes_what_it_encodes() {
        let event = Renamed {
            from: "a".into(),
            to: "b".into(),
        };
        let raw = JsonStringCodec.encode(&event).expect("encode");
        assert_eq!(raw, r#"{"from":"a","to":"b"}"#);
        let decoded: Renamed = JsonStringCodec.decode(&raw, "Renamed").expect("decode");
        assert_eq!(decoded, event);
    }
}
