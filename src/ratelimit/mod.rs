//! Admission control: limiters, their keys, and keyed registries of them.

mod key;
mod limiter;
mod registry;
mod reservoir;

pub use key::{ConversationId, LimiterKey};
pub use limiter::Limiter;
pub use registry::{KeyedRegistry, LimiterFactory};
pub use reservoir::Reservoir;
