//! Chat Throttler - traffic shaping between a chat bot and its platform API
//!
//! This crate paces outbound API calls per destination and against a global
//! budget, and serializes inbound event handling per originating user, so a
//! bot stays inside the messaging platform's rate limits without flooding
//! its own handlers.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod ratelimit;

pub use crate::config::ThrottlerConfig;
pub use dispatch::{ApiDispatcher, OutboundCall};
pub use error::{AdmissionError, CallError, ThrottlerError};
pub use gateway::{
    Continuation, EventContext, RejectionHandler, ReplyWindow, ThrottledApi, Throttler,
};
