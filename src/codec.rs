// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! This module converts application values to and from message payloads. Every
//! codec tags the payload it produces with a content type, and refuses to decode a
//! payload tagged with a different one.
//!
//! Two strategies are provided:
//! - `JsonCodec`: human-readable, schema-less JSON (`application/json`)
//! - `BinaryCodec`: compact bincode encoding of serde records (`application/x-bincode`)

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for bincode messages
pub const BINARY_CONTENT_TYPE: &str = "application/x-bincode";

/// A message as it travels through the broker: payload plus its properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    /// Empty when the message carried no content type.
    pub content_type: String,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(body: Vec<u8>, content_type: &str) -> Envelope {
        Envelope {
            body,
            content_type: content_type.to_owned(),
            message_id: None,
            headers: BTreeMap::default(),
        }
    }
}

/// An encode/decode strategy paired with the content type it produces.
pub trait Codec: Send + Sync + 'static {
    /// The content type written on encoded messages.
    fn content_type(&self) -> &'static str;

    /// Encodes `value` into an envelope tagged with this codec's content type.
    fn encode<T>(&self, value: &T) -> Result<Envelope, AmqpError>
    where
        T: Serialize + ?Sized;

    /// Decodes `body`. A non-empty `content_type` must match this codec's.
    fn decode<T>(&self, body: &[u8], content_type: &str) -> Result<T, AmqpError>
    where
        T: DeserializeOwned;
}

fn check_content_type(expected: &str, received: &str) -> Result<(), AmqpError> {
    if received.is_empty() || received == expected {
        return Ok(());
    }

    error!(expected, received, "content type mismatch");
    Err(AmqpError::DecodeError(format!(
        "content type `{}` cannot be decoded as `{}`",
        received, expected
    )))
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T>(&self, value: &T) -> Result<Envelope, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_vec(value) {
            Ok(body) => Ok(Envelope::new(body, JSON_CONTENT_TYPE)),
            Err(err) => {
                error!(error = err.to_string(), "failure to encode json payload");
                Err(AmqpError::EncodeError(err.to_string()))
            }
        }
    }

    fn decode<T>(&self, body: &[u8], content_type: &str) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        check_content_type(JSON_CONTENT_TYPE, content_type)?;

        serde_json::from_slice(body).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}

/// Binary codec backed by `bincode`.
///
/// Records must be plain serde structs and enums; self-describing types such as
/// `serde_json::Value` cannot be decoded from this format.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn content_type(&self) -> &'static str {
        BINARY_CONTENT_TYPE
    }

    fn encode<T>(&self, value: &T) -> Result<Envelope, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        match bincode::serialize(value) {
            Ok(body) => Ok(Envelope::new(body, BINARY_CONTENT_TYPE)),
            Err(err) => {
                error!(error = err.to_string(), "failure to encode binary payload");
                Err(AmqpError::EncodeError(err.to_string()))
            }
        }
    }

    fn decode<T>(&self, body: &[u8], content_type: &str) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        check_content_type(BINARY_CONTENT_TYPE, content_type)?;

        bincode::deserialize(body).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}
