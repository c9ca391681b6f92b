use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Opaque resume token identifying a client session on the server.
///
/// A new token is generated for every fresh setup. Resuming a session presents the same token
/// again.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionToken(Arc<str>);

impl SessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.0)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SessionToken {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}
