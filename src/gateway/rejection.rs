//! Routing of admission rejections to a pluggable handler.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::error::AdmissionError;
use crate::ratelimit::{ConversationId, LimiterKey};

use super::context::EventContext;

/// Which shaped operation was rejected.
#[derive(Debug, Clone)]
pub enum Origin {
    /// Handling of an inbound event.
    Inbound {
        key: LimiterKey,
        context: EventContext,
    },
    /// An outbound API call.
    Outbound {
        method: String,
        conversation: ConversationId,
    },
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Inbound { key, .. } => write!(f, "Inbound {}", key),
            Origin::Outbound { conversation, .. } => write!(f, "Outbound {}", conversation),
        }
    }
}

/// The refused work, handed to the [`RejectionHandler`] so it can decide
/// to run it anyway.
///
/// Running it bypasses the limiter that refused it. For an inbound event
/// the continuation invokes the event's handler, and for an outbound call
/// it performs the call unshaped. Dropping it discards the work.
pub struct Continuation<'a> {
    work: BoxFuture<'a, ()>,
}

impl<'a> Continuation<'a> {
    pub fn new<F>(work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'a,
    {
        Self {
            work: Box::pin(work),
        }
    }

    /// Run the refused work to completion.
    pub async fn run(self) {
        self.work.await
    }
}

impl std::fmt::Debug for Continuation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation").finish_non_exhaustive()
    }
}

/// Receives work the throttler refused to run.
///
/// Only admission rejections reach the handler. Failures of handlers or of
/// remote calls propagate to their callers unchanged. If the handler runs
/// `next`, the caller gets that outcome as if the work had been admitted.
#[async_trait]
pub trait RejectionHandler: Send + Sync {
    async fn on_rejection(&self, origin: &Origin, error: &AdmissionError, next: Continuation<'_>);
}

#[async_trait]
impl<H: RejectionHandler + ?Sized> RejectionHandler for Arc<H> {
    async fn on_rejection(&self, origin: &Origin, error: &AdmissionError, next: Continuation<'_>) {
        (**self).on_rejection(origin, error, next).await
    }
}

/// Default handler: logs a warning and discards the work.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRejection;

#[async_trait]
impl RejectionHandler for LogRejection {
    async fn on_rejection(&self, origin: &Origin, error: &AdmissionError, _next: Continuation<'_>) {
        warn!("{} | {}", origin, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_display() {
        let inbound = Origin::Inbound {
            key: LimiterKey::from("7"),
            context: EventContext::new().with_user(7),
        };
        let outbound = Origin::Outbound {
            method: "sendMessage".to_string(),
            conversation: ConversationId(-100),
        };

        assert_eq!(inbound.to_string(), "Inbound 7");
        assert_eq!(outbound.to_string(), "Outbound -100");
    }

    #[tokio::test]
    async fn test_default_handler_does_not_fail() {
        let origin = Origin::Outbound {
            method: "sendMessage".to_string(),
            conversation: ConversationId(1),
        };
        LogRejection
            .on_rejection(&origin, &AdmissionError::Overflow, Continuation::new(async {}))
            .await;
    }

    #[tokio::test]
    async fn test_default_handler_discards_work() {
        let origin = Origin::Outbound {
            method: "sendMessage".to_string(),
            conversation: ConversationId(1),
        };
        let mut ran = false;

        LogRejection
            .on_rejection(
                &origin,
                &AdmissionError::Dropped,
                Continuation::new(async { ran = true }),
            )
            .await;

        assert!(!ran);
    }

    #[tokio::test]
    async fn test_continuation_runs_work_once() {
        let mut runs = 0;
        Continuation::new(async { runs += 1 }).run().await;
        assert_eq!(runs, 1);
    }
}
