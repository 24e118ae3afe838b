// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delay Queue Envelope
//!
//! The JSON document travelling through a [`DelayQueue`](crate::delay_queue::DelayQueue):
//! the application payload plus the bookkeeping needed to retry it. The body
//! is carried as a base64 string.

use crate::errors::AmqpError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A delay-queue message.
///
/// `current_attempt` starts at 1 and grows by one on every republish.
/// `total_attempts <= 0` retries forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub total_attempts: i32,
    #[serde(default = "first_attempt")]
    pub current_attempt: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn first_attempt() -> u32 {
    1
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;

        BASE64.decode(text).map_err(Error::custom)
    }
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();

        Self {
            body: body.into(),
            content_type: String::new(),
            total_attempts: 0,
            current_attempt: first_attempt(),
            created_at: now,
            last_attempt_at: now,
            trace_id: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// Caps the number of deliveries; `0` (the default) retries forever.
    pub fn with_total_attempts(mut self, total_attempts: i32) -> Self {
        self.total_attempts = total_attempts;
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_owned(), value);
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.total_attempts <= 0
    }

    /// Whether a failure of the current attempt leads to another one.
    pub fn has_attempts_left(&self) -> bool {
        self.is_unbounded() || i64::from(self.current_attempt) < i64::from(self.total_attempts)
    }

    /// Stamps a message about to be published for the first time.
    pub(crate) fn prepare_first_publish(&mut self) {
        let now = Utc::now();

        self.current_attempt = first_attempt();
        self.created_at = now;
        self.last_attempt_at = now;
        self.trace_id = Uuid::new_v4().to_string();
    }

    /// The message to republish after a failed attempt.
    pub(crate) fn next_attempt(&self) -> Message {
        Message {
            current_attempt: self.current_attempt.saturating_add(1),
            last_attempt_at: Utc::now(),
            trace_id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Message, AmqpError> {
        serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}
