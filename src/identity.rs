//! Cross-channel identity resolution.

use std::collections::HashMap;
use std::fmt;

/// Resolved conversational key shared by memory and sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapses channel-qualified sender ids onto shared identities.
///
/// Lookup order: the full sender id (`telegram:42`), then the bare id (`42`).
/// Unmapped senders resolve to their channel-qualified id unchanged.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    aliases: HashMap<String, String>,
}

impl IdentityResolver {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        let aliases = aliases
            .into_iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        Self { aliases }
    }

    pub fn resolve(&self, sender_id: &str) -> Identity {
        if let Some(alias) = self.aliases.get(sender_id) {
            return Identity::new(alias.clone());
        }
        if let Some((_, bare)) = sender_id.split_once(':')
            && let Some(alias) = self.aliases.get(bare)
        {
            return Identity::new(alias.clone());
        }
        Identity::new(sender_id)
    }
}
