//! Transport-level message envelope.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Message headers. Single-valued; keys are case-sensitive.
pub type Headers = BTreeMap<String, String>;

/// Header carrying the error message of a failed call.
pub const ERROR_HEADER: &str = "Nats-Service-Error";

/// Header carrying the error code of a failed call.
pub const ERROR_CODE_HEADER: &str = "Nats-Service-Error-Code";

/// A message as published to or delivered by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Concrete subject the message was published on.
    pub subject: String,
    /// Subject the receiver should answer on, if any.
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Message {
    /// Creates a message with no reply target and no headers.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Returns `(code, message)` if this message is an error response.
    #[must_use]
    pub fn service_error(&self) -> Option<(&str, &str)> {
        let code = self.headers.get(ERROR_CODE_HEADER)?;
        let message = self.headers.get(ERROR_HEADER).map_or("", String::as_str);
        Some((code.as_str(), message))
    }
}
