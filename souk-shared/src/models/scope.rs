use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Logical stream a subscription targets.
///
/// The text form (`conversation:<uuid>`, `inbox:<uuid>`, `feed:<status>`) is
/// used on the wire and on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    /// Messages of one conversation
    Conversation(Uuid),
    /// Every inbound message addressed to one user
    Inbox(Uuid),
    /// Listings matching a status filter
    Feed(String),
}

/// Scope discriminant, used to pick per-kind timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Conversation scope
    Conversation,
    /// Inbox scope
    Inbox,
    /// Listing feed scope
    Feed,
}

impl Scope {
    /// Discriminant of this scope.
    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        match self {
            Self::Conversation(_) => ScopeKind::Conversation,
            Self::Inbox(_) => ScopeKind::Inbox,
            Self::Feed(_) => ScopeKind::Feed,
        }
    }

    /// Conversation id for conversation scopes.
    #[must_use]
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::Conversation(id) => Some(*id),
            _ => None,
        }
    }
}

/// Errors from parsing the text form of a [`Scope`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeParseError {
    /// Missing the `kind:` prefix
    #[error("scope must look like `<kind>:<target>`, got `{0}`")]
    Malformed(String),
    /// Prefix is not a known scope kind
    #[error("unknown scope kind `{0}` (expected conversation, inbox or feed)")]
    UnknownKind(String),
    /// Target is not a valid UUID
    #[error("invalid id in scope: {0}")]
    InvalidId(String),
    /// Feed scope without a status
    #[error("feed status filter must not be empty")]
    EmptyStatus,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Inbox(id) => write!(f, "inbox:{id}"),
            Self::Feed(status) => write!(f, "feed:{status}"),
        }
    }
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, target) = value
            .split_once(':')
            .ok_or_else(|| ScopeParseError::Malformed(value.to_string()))?;
        let target = target.trim();

        let parse_id = |raw: &str| {
            Uuid::parse_str(raw).map_err(|err| ScopeParseError::InvalidId(err.to_string()))
        };

        match kind.trim() {
            "conversation" => Ok(Self::Conversation(parse_id(target)?)),
            "inbox" => Ok(Self::Inbox(parse_id(target)?)),
            "feed" if target.is_empty() => Err(ScopeParseError::EmptyStatus),
            "feed" => Ok(Self::Feed(target.to_string())),
            other => Err(ScopeParseError::UnknownKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = ScopeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_round_trips() {
        let id = Uuid::new_v4();
        for scope in [
            Scope::Conversation(id),
            Scope::Inbox(id),
            Scope::Feed("active".into()),
        ] {
            assert_eq!(scope.to_string().parse::<Scope>().unwrap(), scope);
        }
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            "conversation".parse::<Scope>(),
            Err(ScopeParseError::Malformed("conversation".into()))
        );
        assert_eq!(
            "thread:abc".parse::<Scope>(),
            Err(ScopeParseError::UnknownKind("thread".into()))
        );
        assert!(matches!(
            "inbox:not-a-uuid".parse::<Scope>(),
            Err(ScopeParseError::InvalidId(_))
        ));
        assert_eq!("feed:".parse::<Scope>(), Err(ScopeParseError::EmptyStatus));
    }

    #[test]
    fn serializes_as_string() {
        let scope = Scope::Feed("sold".into());
        assert_eq!(serde_json::to_string(&scope).unwrap(), "\"feed:sold\"");
        let back: Scope = serde_json::from_str("\"feed:sold\"").unwrap();
        assert_eq!(back, scope);
    }
}
