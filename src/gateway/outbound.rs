//! Outbound call interception.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, trace};

use super::classifier::{BypassReason, Route};
use super::context::ReplyWindow;
use super::rejection::{Continuation, Origin};
use super::Shared;
use crate::dispatch::{ApiDispatcher, OutboundCall};
use crate::error::{AdmissionError, CallError};
use crate::ratelimit::LimiterKey;

/// The host's dispatcher wrapped with outbound shaping.
///
/// Obtained from [`Throttler::api`](super::Throttler::api) or handed to the
/// continuation of [`Throttler::handle`](super::Throttler::handle), where it
/// is bound to the event's reply window.
pub struct ThrottledApi<D> {
    shared: Arc<Shared<D>>,
    window: Option<ReplyWindow>,
}

impl<D> ThrottledApi<D> {
    pub(super) fn new(shared: Arc<Shared<D>>, window: Option<ReplyWindow>) -> Self {
        Self { shared, window }
    }

    /// The reply window calls made through this handle may use.
    pub fn reply_window(&self) -> Option<&ReplyWindow> {
        self.window.as_ref()
    }
}

impl<D> Clone for ThrottledApi<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            window: self.window.clone(),
        }
    }
}

#[async_trait]
impl<D: ApiDispatcher + 'static> ApiDispatcher for ThrottledApi<D> {
    type Error = CallError<D::Error>;

    /// Send `call` once every tier on its route has admitted it.
    #[instrument(skip(self, call), fields(method = %call.method))]
    async fn call_api(&self, call: OutboundCall) -> Result<Value, Self::Error> {
        let shared = &self.shared;

        let (conversation, limiter) = match shared.classifier.classify(&call, self.window.as_ref()) {
            Route::Bypass(reason) => {
                trace!(?reason, "Sending call unshaped");
                let call = OutboundCall {
                    inline_reply: reason == BypassReason::InlineReply,
                    ..call
                };
                return shared.dispatcher.call_api(call).await.map_err(CallError::Api);
            }
            Route::Egress(id) => (id, Arc::clone(&shared.egress)),
            Route::Group(id) => (id, shared.group.for_key(&LimiterKey::from(id))),
        };

        trace!(conversation = %conversation, limiter = limiter.name(), "Scheduling call");

        let cancel = call.cancel.clone();
        // Kept for the rejection handler, which may resume the call unshaped.
        let resumable = call.clone();
        let outcome = limiter
            .schedule_cancellable(shared.dispatcher.call_api(call), cancel.as_ref())
            .await;

        match outcome {
            Ok(result) => result.map_err(CallError::Api),
            Err(AdmissionError::Cancelled) => Err(CallError::Cancelled),
            Err(error) => {
                let origin = Origin::Outbound {
                    method: resumable.method.clone(),
                    conversation,
                };
                let mut resumed = None;
                shared
                    .on_rejection
                    .on_rejection(
                        &origin,
                        &error,
                        Continuation::new(async {
                            resumed = Some(shared.dispatcher.call_api(resumable).await);
                        }),
                    )
                    .await;

                match resumed {
                    Some(result) => result.map_err(CallError::Api),
                    None => Err(CallError::Rejected(error)),
                }
            }
        }
    }
}
