//! Typed boundary for cross-boundary values.
//!
//! The engine itself moves opaque strings; typed registration helpers and
//! client methods encode and decode through this module so payloads stay
//! JSON-compatible end to end.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encoding used at the serialization boundary.
pub trait Codec {
    fn encode<T: Serialize>(value: &T) -> Result<String, String>;
    fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, String>;
}

/// JSON codec; the only one the engine ships.
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, String> {
        serde_json::from_str(payload).map_err(|e| format!("decode: {e}"))
    }
}
