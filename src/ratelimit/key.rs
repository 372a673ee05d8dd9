//! Conversation identities and the limiter keys derived from them.

use serde_json::Value;

/// Numeric chat identifier as used by the messaging platform.
///
/// Positive values address a single user, zero and negative values address
/// a group or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationId(pub i64);

impl ConversationId {
    /// Read an identifier from a payload value.
    ///
    /// Integral JSON numbers and decimal strings are accepted. Anything else
    /// (usernames such as `@channel`, empty strings, fractional numbers)
    /// has no numeric identity.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(id) = n.as_i64() {
                    return Some(Self(id));
                }
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Self(f as i64))
            }
            Value::String(s) => s.trim().parse::<i64>().ok().map(Self),
            _ => None,
        }
    }

    /// Whether this addresses a multi-party chat.
    pub fn is_group(&self) -> bool {
        self.0 <= 0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key selecting one limiter inside a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey(String);

impl LimiterKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<ConversationId> for LimiterKey {
    fn from(id: ConversationId) -> Self {
        Self(id.0.to_string())
    }
}

impl From<&str> for LimiterKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
