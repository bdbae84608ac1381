//! The `"<ts>:<member>"` tuple published on every applied write.

use crate::timestamp::Timestamp;

const SEPARATOR: char = ':';

/// One replicated write: a marshaled member and its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub ts: Timestamp,
    pub member: String,
}

impl Update {
    pub fn new(ts: Timestamp, member: impl Into<String>) -> Self {
        Self {
            ts,
            member: member.into(),
        }
    }

    pub fn encode(&self) -> String {
        encode(self.ts, &self.member)
    }

    /// Splits a published payload on its first colon only, since members
    /// may contain colons of their own.
    ///
    /// Returns `None` when there is no separator at all. A bad timestamp
    /// part still yields an update, stamped [`Timestamp::ZERO`].
    pub fn decode(payload: &str) -> Option<Self> {
        let (ts, member) = payload.split_once(SEPARATOR)?;
        Some(Self::new(Timestamp::parse_lossy(ts), member))
    }
}

pub fn encode(ts: Timestamp, member: &str) -> String {
    format!("{}{SEPARATOR}{member}", ts.as_micros())
}
