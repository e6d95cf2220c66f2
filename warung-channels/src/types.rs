use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(TenantId);
id_newtype!(ChatId);
id_newtype!(MessageId);

/// Addresses one ongoing exchange: a tenant plus the chat identity derived
/// from the customer's phone number (e.g. `628123456789@c.us`). Never shared
/// across tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub tenant: TenantId,
    pub chat: ChatId,
}

impl ConversationKey {
    /// Build a key from raw webhook fields, normalizing both parts.
    ///
    /// Returns `None` when either side is empty after trimming or would
    /// collide with the cache-key separator.
    pub fn parse(tenant: &str, chat: &str) -> Option<Self> {
        let tenant = tenant.trim();
        let chat = chat.trim();
        if tenant.is_empty() || chat.is_empty() {
            return None;
        }
        if tenant.contains(':') || tenant.contains(char::is_whitespace) {
            return None;
        }
        if chat.contains(':') || chat.contains(char::is_whitespace) {
            return None;
        }
        Some(Self {
            tenant: TenantId::new(tenant),
            chat: ChatId::new(chat),
        })
    }

    /// Stable token used as the per-conversation suffix in cache keys.
    pub fn cache_token(&self) -> String {
        format!("{}:{}", self.tenant, self.chat)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant, self.chat)
    }
}

/// One raw provider event as consumed by the pipeline: chat identity, text,
/// provider message id, arrival timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: Option<MessageId>,
    pub conversation: ConversationKey,
    pub text: String,
    pub from_me: bool,
    pub received_at: DateTime<Utc>,
}

/// Payload for the provider's send API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub conversation: ConversationKey,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub job_id: Option<uuid::Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_normalizes_whitespace() {
        let key = ConversationKey::parse(" acme ", " 628123@c.us ").unwrap();
        assert_eq!(key.tenant.as_str(), "acme");
        assert_eq!(key.chat.as_str(), "628123@c.us");
        assert_eq!(key.cache_token(), "acme:628123@c.us");
    }

    #[test]
    fn conversation_key_rejects_empty_or_reserved_chars() {
        assert!(ConversationKey::parse("", "628123@c.us").is_none());
        assert!(ConversationKey::parse("acme", "   ").is_none());
        assert!(ConversationKey::parse("ac:me", "628123@c.us").is_none());
        assert!(ConversationKey::parse("acme", "6281 23@c.us").is_none());
    }
}
