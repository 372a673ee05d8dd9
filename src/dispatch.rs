//! Outbound API calls and the trait the host implements to perform them.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::ConversationId;

/// Payload field naming the destination chat.
pub const DESTINATION_FIELD: &str = "chat_id";

/// A single call to the messaging platform API.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    /// API method name, e.g. `sendMessage`
    pub method: String,
    /// Call parameters
    pub payload: Map<String, Value>,
    /// Caller-side cancellation, handed through to the dispatcher once the
    /// call has been admitted
    pub cancel: Option<CancellationToken>,
    /// Set when the call claimed the event's reply window. The dispatcher
    /// must write such a call to the open inbound channel instead of sending
    /// it as a remote request, since it skipped every limiter.
    pub inline_reply: bool,
}

impl OutboundCall {
    /// Create a call with an empty payload.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            payload: Map::new(),
            cancel: None,
            inline_reply: false,
        }
    }

    /// Add a payload parameter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(field.into(), value.into());
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The numeric destination of this call, if it has one.
    pub fn destination(&self) -> Option<ConversationId> {
        self.payload
            .get(DESTINATION_FIELD)
            .and_then(ConversationId::from_value)
    }
}

/// The host's entry point for calls to the remote API.
///
/// The throttler wraps an implementation of this trait and exposes the
/// wrapped version through the same trait, so the host can use either one.
#[async_trait]
pub trait ApiDispatcher: Send + Sync {
    /// Failure reported by the remote call.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Perform `call` and return the API's result.
    async fn call_api(&self, call: OutboundCall) -> Result<Value, Self::Error>;
}

#[async_trait]
impl<D: ApiDispatcher + ?Sized> ApiDispatcher for Arc<D> {
    type Error = D::Error;

    async fn call_api(&self, call: OutboundCall) -> Result<Value, Self::Error> {
        (**self).call_api(call).await
    }
}
