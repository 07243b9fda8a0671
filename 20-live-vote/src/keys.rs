//! Key layout for sessions, options, and result counters.
//!
//! ```text
//! {root}sessions/{session_id}/info
//! {root}sessions/{session_id}/options/{option_id}
//! {root}sessions/{session_id}/results/{option_id}
//! ```

use std::fmt;

use crate::error::VoteError;

/// Opaque session identifier, safe to splice into a key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Rejects identifiers that would escape their key segment. Such ids can
    /// never name a stored session, so they are reported as not found.
    pub fn parse(raw: &str) -> Result<Self, VoteError> {
        if is_segment(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(VoteError::NotFound)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Option identifier: a small integer, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionId(pub u32);

impl OptionId {
    /// Accepts only the canonical decimal form used in option keys, so `"01"`,
    /// `"+1"` and `" 1"` never alias option `1`.
    pub fn parse(raw: &str) -> Result<Self, VoteError> {
        let id: u32 = raw.parse().map_err(|_| VoteError::NotFound)?;
        if raw != id.to_string() {
            return Err(VoteError::NotFound);
        }
        Ok(Self(id))
    }
}

impl fmt::Display for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_segment(raw: &str) -> bool {
    !raw.is_empty() && !raw.contains('/')
}

#[derive(Debug, Clone, Default)]
pub struct Keyspace {
    root: String,
}

impl Keyspace {
    /// `root` is prepended verbatim, so pass `"/votes/"` rather than `"/votes"`.
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn sessions_prefix(&self) -> String {
        format!("{}sessions/", self.root)
    }

    pub fn session_prefix(&self, session: &SessionId) -> String {
        format!("{}{}/", self.sessions_prefix(), session)
    }

    pub fn info_key(&self, session: &SessionId) -> String {
        format!("{}info", self.session_prefix(session))
    }

    pub fn options_prefix(&self, session: &SessionId) -> String {
        format!("{}options/", self.session_prefix(session))
    }

    pub fn option_key(&self, session: &SessionId, option: OptionId) -> String {
        format!("{}{}", self.options_prefix(session), option)
    }

    pub fn results_prefix(&self, session: &SessionId) -> String {
        format!("{}results/", self.session_prefix(session))
    }

    pub fn result_key(&self, session: &SessionId, option: OptionId) -> String {
        format!("{}{}", self.results_prefix(session), option)
    }

    /// Extracts the session id from any key under [`Self::sessions_prefix`].
    pub fn session_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(self.sessions_prefix().as_str())?;
        rest.split('/').next().filter(|id| !id.is_empty())
    }
}

/// Last path segment of a key, used as the option id in results snapshots.
pub fn trailing_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
