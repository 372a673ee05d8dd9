//! Decides which tier governs an outbound call.

use std::collections::HashSet;

use crate::config::ExemptionConfig;
use crate::dispatch::OutboundCall;
use crate::ratelimit::ConversationId;

use super::context::ReplyWindow;

/// Where an outbound call is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Sent immediately without shaping.
    Bypass(BypassReason),
    /// Paced only by the global egress gate.
    Egress(ConversationId),
    /// Paced by the group's own limiter, then by the egress gate.
    Group(ConversationId),
}

/// Why a call skipped shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// The call has no numeric destination.
    NoDestination,
    /// The call is answered on the open inbound channel.
    InlineReply,
}

/// Routes outbound calls according to their destination and method.
#[derive(Debug, Clone)]
pub struct CallClassifier {
    inline_methods: HashSet<String>,
    group_exempt_methods: HashSet<String>,
}

impl CallClassifier {
    pub fn new(exemptions: &ExemptionConfig) -> Self {
        Self {
            inline_methods: exemptions.inline_methods.iter().cloned().collect(),
            group_exempt_methods: exemptions.group_exempt_methods.iter().cloned().collect(),
        }
    }

    /// Pick the route for `call`.
    ///
    /// Choosing [`BypassReason::InlineReply`] claims `window`, so at most one
    /// call per window goes out inline.
    pub fn classify(&self, call: &OutboundCall, window: Option<&ReplyWindow>) -> Route {
        let Some(destination) = call.destination() else {
            return Route::Bypass(BypassReason::NoDestination);
        };

        if self.inline_methods.contains(&call.method) {
            if let Some(window) = window {
                if window.try_claim() {
                    return Route::Bypass(BypassReason::InlineReply);
                }
            }
        }

        if !destination.is_group() || self.group_exempt_methods.contains(&call.method) {
            Route::Egress(destination)
        } else {
            Route::Group(destination)
        }
    }
}

impl Default for CallClassifier {
    fn default() -> Self {
        Self::new(&ExemptionConfig::default())
    }
}
