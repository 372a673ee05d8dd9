//! Inbound event context and the synchronous reply window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ratelimit::{ConversationId, LimiterKey};

/// Tracks whether a reply can still be written to the open inbound channel
/// (e.g. the HTTP response of a webhook delivery).
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct ReplyWindow {
    open: Arc<AtomicBool>,
}

impl ReplyWindow {
    /// Create an open window.
    pub fn open() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether a reply can still be written.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the channel as finished.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Take the window for a single reply. Only the first caller succeeds.
    pub fn try_claim(&self) -> bool {
        self.open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What the throttler needs to know about an inbound event.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Platform update identifier, used for logging
    pub update_id: Option<i64>,
    /// User that triggered the event
    pub user_id: Option<i64>,
    /// Chat the event arrived in
    pub chat_id: Option<ConversationId>,
    /// Set when the transport allows answering inline
    pub reply_window: Option<ReplyWindow>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update_id(mut self, update_id: i64) -> Self {
        self.update_id = Some(update_id);
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(ConversationId(chat_id));
        self
    }

    pub fn with_reply_window(mut self, window: ReplyWindow) -> Self {
        self.reply_window = Some(window);
        self
    }

    /// Key used to serialize handling for this event's originator: the user
    /// when known, otherwise the chat.
    pub fn limiter_key(&self) -> Option<LimiterKey> {
        self.user_id
            .map(ConversationId)
            .or(self.chat_id)
            .map(LimiterKey::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_claimed_once() {
        let window = ReplyWindow::open();
        let shared = window.clone();

        assert!(window.is_open());
        assert!(shared.try_claim());
        assert!(!window.try_claim());
        assert!(!window.is_open());
    }

    #[test]
    fn test_closed_window_cannot_be_claimed() {
        let window = ReplyWindow::open();
        window.close();
        assert!(!window.try_claim());
    }

    #[test]
    fn test_key_prefers_user() {
        let ctx = EventContext::new().with_user(7).with_chat(-100);
        assert_eq!(ctx.limiter_key(), Some(LimiterKey::from("7")));
    }

    #[test]
    fn test_key_falls_back_to_chat() {
        let ctx = EventContext::new().with_chat(-100);
        assert_eq!(ctx.limiter_key(), Some(LimiterKey::from("-100")));
    }

    #[test]
    fn test_no_key_without_originator() {
        assert_eq!(EventContext::new().with_update_id(1).limiter_key(), None);
    }
}
