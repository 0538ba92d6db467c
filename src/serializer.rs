// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! The core never interprets payload bytes. It attaches the content type produced by
//! a `Serializer` on publish, and hands the bytes plus headers back to it on consume.

use crate::{errors::AmqpError, message::MessageProperties};
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes and decodes payloads.
pub trait Serializer: Send + Sync + 'static {
    /// Encodes `value`.
    ///
    /// # Returns
    /// The payload bytes and the content type to attach
    fn encode<T: Serialize>(&self, value: &T) -> Result<(Vec<u8>, String), AmqpError>;

    /// Decodes `bytes`, checking the content type found in `properties`.
    fn decode<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        properties: &MessageProperties,
    ) -> Result<T, AmqpError>;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode<T: Serialize>(&self, value: &T) -> Result<(Vec<u8>, String), AmqpError> {
        let bytes =
            serde_json::to_vec(value).map_err(|err| AmqpError::SerializationError(err.to_string()))?;
        Ok((bytes, JSON_CONTENT_TYPE.to_owned()))
    }

    fn decode<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        properties: &MessageProperties,
    ) -> Result<T, AmqpError> {
        match properties.content_type.as_deref() {
            None | Some(JSON_CONTENT_TYPE) => {}
            Some(other) => {
                return Err(AmqpError::SerializationError(format!(
                    "unsupported content type `{other}`"
                )))
            }
        }

        serde_json::from_slice(bytes).map_err(|err| AmqpError::SerializationError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        id: u32,
    }

    #[test]
    fn encodes_with_content_type() {
        let (bytes, content_type) = JsonSerializer.encode(&OrderCreated { id: 7 }).unwrap();
        assert_eq!(content_type, JSON_CONTENT_TYPE);
        assert_eq!(bytes, br#"{"id":7}"#.to_vec());
    }

    #[test]
    fn rejects_foreign_content_type_and_garbage() {
        let props = MessageProperties {
            content_type: Some("application/xml".to_owned()),
            ..MessageProperties::default()
        };
        let err = JsonSerializer.decode::<OrderCreated>(b"{}", &props).unwrap_err();
        assert!(matches!(err, AmqpError::SerializationError(_)));

        let err = JsonSerializer
            .decode::<OrderCreated>(b"not json", &MessageProperties::default())
            .unwrap_err();
        assert!(matches!(err, AmqpError::SerializationError(_)));
    }
}
