//! Explicit per-request context threaded through validator, middleware,
//! and handler.
//!
//! Nothing about a request lives in ambient state: every stage receives the
//! same `RequestContext` by `&mut`, so concurrent requests on one instance
//! never observe each other.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::warn;

use microbus_core::{ErrorDescriptor, Headers, Message, ERROR_CODE_HEADER, ERROR_HEADER};

use super::operation::{error_codes, Outcome};

// ---------------------------------------------------------------------------
// ServiceError
// ---------------------------------------------------------------------------

/// Error a handler or middleware can return to control the wire error code.
///
/// Any other error type is reported with code `"500"` and its display text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
    pub code: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Maps an arbitrary handler error to its wire descriptor.
    #[must_use]
    pub fn descriptor_for(err: &anyhow::Error) -> ErrorDescriptor {
        match err.downcast_ref::<ServiceError>() {
            Some(service_err) => {
                ErrorDescriptor::new(service_err.code.clone(), service_err.message.clone())
            }
            None => ErrorDescriptor::new(error_codes::INTERNAL, err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Read-only view of an inbound call.
#[derive(Debug, Clone)]
pub struct Request {
    /// Subject the message was actually published on.
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
    /// Registered method the subject resolved to.
    pub method: String,
    pub service: String,
    pub instance_id: String,
}

impl Request {
    #[must_use]
    pub fn from_message(message: Message, method: &str, service: &str, instance_id: &str) -> Self {
        Self {
            subject: message.subject,
            reply: message.reply,
            headers: message.headers,
            payload: message.payload,
            method: method.to_string(),
            service: service.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns a `400` [`ServiceError`] if the payload is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ServiceError::new(error_codes::BAD_REQUEST, e.to_string()).into())
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Response lifecycle. Anything other than `Open` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseState {
    Open,
    Sent(Bytes),
    Failed(ErrorDescriptor),
    Suppressed,
}

/// Response under construction. The first terminal action wins; later ones
/// are ignored with a warning.
#[derive(Debug)]
pub struct Response {
    state: ResponseState,
    headers: Headers,
    ignored_actions: u32,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            state: ResponseState::Open,
            headers: Headers::new(),
            ignored_actions: 0,
        }
    }
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state != ResponseState::Open
    }

    #[must_use]
    pub fn state(&self) -> &ResponseState {
        &self.state
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Number of terminal actions that arrived after the response closed.
    #[must_use]
    pub fn ignored_actions(&self) -> u32 {
        self.ignored_actions
    }

    /// Sets a response header. Allowed until the outcome is taken.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Sends a success payload. Returns `false` if the response was already closed.
    pub fn send(&mut self, payload: impl Into<Bytes>) -> bool {
        self.close(ResponseState::Sent(payload.into()))
    }

    /// Sends an error. Returns `false` if the response was already closed.
    pub fn error(&mut self, code: impl Into<String>, message: impl Into<String>) -> bool {
        self.close(ResponseState::Failed(ErrorDescriptor::new(code, message)))
    }

    /// Closes the response without answering.
    pub fn suppress(&mut self) -> bool {
        self.close(ResponseState::Suppressed)
    }

    fn close(&mut self, next: ResponseState) -> bool {
        if self.is_closed() {
            self.ignored_actions += 1;
            warn!(
                current = ?self.state,
                ignored = ?next,
                "response already closed; ignoring additional terminal action"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Converts the response into the dispatch outcome. A response left open
    /// is answered with an empty success payload.
    #[must_use]
    pub fn into_outcome(self) -> Outcome {
        let mut headers = self.headers;
        match self.state {
            ResponseState::Open => Outcome::Reply {
                payload: Bytes::new(),
                headers,
            },
            ResponseState::Sent(payload) => Outcome::Reply { payload, headers },
            ResponseState::Failed(error) => {
                headers.insert(ERROR_HEADER.to_string(), error.message.clone());
                headers.insert(ERROR_CODE_HEADER.to_string(), error.code.clone());
                Outcome::Error { error, headers }
            }
            ResponseState::Suppressed => Outcome::Suppressed,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Request plus response being built, shared by every pipeline stage.
#[derive(Debug)]
pub struct RequestContext {
    pub request: Request,
    pub response: Response,
}

impl RequestContext {
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: Response::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(payload: &'static str) -> Request {
        Request::from_message(Message::new("echo.say", payload), "say", "echo", "id1")
    }

    #[test]
    fn first_terminal_action_wins() {
        let mut res = Response::new();
        assert!(res.send("a"));
        assert!(!res.error("500", "late"));
        assert!(!res.suppress());
        assert_eq!(res.ignored_actions(), 2);
        assert_eq!(res.state(), &ResponseState::Sent(Bytes::from("a")));
    }

    #[test]
    fn open_response_becomes_empty_reply() {
        let mut res = Response::new();
        res.set_header("x", "1");
        match res.into_outcome() {
            Outcome::Reply { payload, headers } => {
                assert!(payload.is_empty());
                assert_eq!(headers.get("x").map(String::as_str), Some("1"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn failed_response_carries_error_headers() {
        let mut res = Response::new();
        res.error("418", "teapot");
        match res.into_outcome() {
            Outcome::Error { error, headers } => {
                assert_eq!(error.code, "418");
                assert_eq!(headers.get(ERROR_CODE_HEADER).map(String::as_str), Some("418"));
                assert_eq!(headers.get(ERROR_HEADER).map(String::as_str), Some("teapot"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn descriptor_for_uses_service_error_code() {
        let err: anyhow::Error = ServiceError::new("404", "missing").into();
        assert_eq!(ServiceError::descriptor_for(&err), ErrorDescriptor::new("404", "missing"));

        let err = anyhow::anyhow!("boom");
        assert_eq!(ServiceError::descriptor_for(&err), ErrorDescriptor::new("500", "boom"));
    }

    #[test]
    fn json_decoding_errors_are_bad_requests() {
        #[derive(Debug, serde::Deserialize)]
        struct Body {
            #[allow(dead_code)]
            n: u32,
        }
        let err = request("not json").json::<Body>().unwrap_err();
        assert_eq!(ServiceError::descriptor_for(&err).code, "400");
        assert_eq!(request(r#"{"n":1}"#).json::<Body>().unwrap().n, 1);
    }
}
