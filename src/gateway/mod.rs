//! The throttling gateway: inbound middleware plus outbound call shaping.
//!
//! A [`Throttler`] owns three tiers:
//!
//! - the **egress gate**, one limiter holding the platform's global outbound
//!   budget;
//! - the **group registry**, one limiter per group chat, each chained into
//!   the egress gate when it is created;
//! - the **inbound registry**, one limiter per originating user (or chat)
//!   guarding handler invocations.

mod classifier;
mod context;
mod outbound;
mod rejection;

pub use classifier::{BypassReason, CallClassifier, Route};
pub use context::{EventContext, ReplyWindow};
pub use outbound::ThrottledApi;
pub use rejection::{Continuation, LogRejection, Origin, RejectionHandler};

use std::future::Future;
use std::sync::Arc;
use tracing::{info, instrument, trace};

use crate::config::ThrottlerConfig;
use crate::dispatch::ApiDispatcher;
use crate::error::Result;
use crate::ratelimit::{KeyedRegistry, Limiter};

/// State shared by the throttler and every API handle it gives out.
pub(crate) struct Shared<D> {
    dispatcher: D,
    classifier: CallClassifier,
    egress: Arc<Limiter>,
    group: KeyedRegistry,
    inbound: KeyedRegistry,
    on_rejection: Arc<dyn RejectionHandler>,
}

/// Traffic-shaping gateway between a bot and its platform API.
///
/// Build one per process and share it; clones refer to the same limiters.
pub struct Throttler<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for Throttler<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: ApiDispatcher + 'static> Throttler<D> {
    /// Create a throttler that logs rejected work.
    pub fn new(config: ThrottlerConfig, dispatcher: D) -> Result<Self> {
        Self::with_rejection_handler(config, dispatcher, LogRejection)
    }

    /// Create a throttler that reports rejected work to `handler`.
    ///
    /// Fails if the configuration is invalid.
    pub fn with_rejection_handler<H>(
        config: ThrottlerConfig,
        dispatcher: D,
        handler: H,
    ) -> Result<Self>
    where
        H: RejectionHandler + 'static,
    {
        config.validate()?;

        let egress = Arc::new(Limiter::new("egress", config.egress.clone()));
        let gate = Arc::clone(&egress);
        let group = KeyedRegistry::with_factory(
            "group",
            config.group.clone(),
            config.idle_timeout(),
            move |limiter| limiter.chained(Arc::clone(&gate)),
        );
        let inbound = KeyedRegistry::new("inbound", config.inbound.clone(), config.idle_timeout());

        info!(
            group = ?config.group,
            egress = ?config.egress,
            inbound = ?config.inbound,
            "Throttler initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                dispatcher,
                classifier: CallClassifier::new(&config.exemptions),
                egress,
                group,
                inbound,
                on_rejection: Arc::new(handler),
            }),
        })
    }

    /// Shaped API handle with no reply window.
    pub fn api(&self) -> ThrottledApi<D> {
        ThrottledApi::new(Arc::clone(&self.shared), None)
    }

    /// Shaped API handle bound to `ctx`'s reply window.
    pub fn api_for(&self, ctx: &EventContext) -> ThrottledApi<D> {
        ThrottledApi::new(Arc::clone(&self.shared), ctx.reply_window.clone())
    }

    /// Run `next` for an inbound event once its originator's limiter admits
    /// it.
    ///
    /// `next` receives the API handle to use while handling the event and is
    /// called at most once. If the event is rejected, the rejection handler
    /// gets `next` as a [`Continuation`]. The result is `None` unless `next`
    /// ran, either after admission or from the handler. Events with neither
    /// a user nor a chat are handled without shaping.
    #[instrument(skip_all, fields(update_id = ?ctx.update_id))]
    pub async fn handle<F, Fut, T>(&self, ctx: EventContext, next: F) -> Option<T>
    where
        F: FnOnce(ThrottledApi<D>) -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let api = self.api_for(&ctx);

        let Some(key) = ctx.limiter_key() else {
            trace!("Event has no originator, handling unshaped");
            return Some(next(api).await);
        };

        // Held outside the scheduled task so a rejected event can be resumed.
        let mut pending = Some((next, api));
        let limiter = self.shared.inbound.for_key(&key);
        let scheduled = limiter
            .schedule(async {
                let (next, api) = pending.take()?;
                Some(next(api).await)
            })
            .await;

        let error = match scheduled {
            Ok(output) => return output,
            Err(error) => error,
        };
        let (next, api) = pending.take()?;

        let origin = Origin::Inbound { key, context: ctx };
        let mut output = None;
        self.shared
            .on_rejection
            .on_rejection(
                &origin,
                &error,
                Continuation::new(async {
                    output = Some(next(api).await);
                }),
            )
            .await;
        output
    }

    /// The global outbound limiter.
    pub fn egress(&self) -> &Arc<Limiter> {
        &self.shared.egress
    }

    /// Per-group outbound limiters.
    pub fn group_registry(&self) -> &KeyedRegistry {
        &self.shared.group
    }

    /// Per-originator inbound limiters.
    pub fn inbound_registry(&self) -> &KeyedRegistry {
        &self.shared.inbound
    }

    /// The wrapped dispatcher.
    pub fn dispatcher(&self) -> &D {
        &self.shared.dispatcher
    }
}
