//! C2 — the subscriber filter set: the (apid, ctid) pairs a dispatcher
//! uses to route frames to a context's queue (spec §4.2), plus the
//! richer `Criterion` predicate used by the CLI and tests for
//! ad-hoc message inspection (spec §9 Design Note).

use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::codec::{DltMessage, FourCc, LogLevel, MessageType};

/// Maximum number of (apid, ctid) pairs a single `FilterSet` may hold
/// (spec §4.2).
pub const MAX_PAIRS: usize = 30;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter set already holds the maximum of {MAX_PAIRS} pairs")]
    MaxReached,
    #[error("pair ({0}, {1}) is already present")]
    Duplicate(String, String),
}

/// An `(apid, ctid)` pair; either half may be empty to mean "any".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FilterPair {
    pub apid: FourCc,
    pub ctid: FourCc,
}

/// A bounded set of `(apid, ctid)` subscription pairs (spec §4.2).
///
/// Matching follows the four-pattern rule used by the dispatcher's
/// per-message lookup: an exact pair, a wildcard-wildcard pair, an
/// apid-only pair, or a ctid-only pair all count as a match.
#[derive(Clone, Debug, Default)]
pub struct FilterSet {
    pairs: Vec<FilterPair>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Adds a pair, rejecting duplicates and enforcing [`MAX_PAIRS`].
    pub fn add(&mut self, apid: FourCc, ctid: FourCc) -> Result<(), FilterError> {
        let pair = FilterPair { apid, ctid };
        if self.pairs.contains(&pair) {
            return Err(FilterError::Duplicate(apid.to_string(), ctid.to_string()));
        }
        if self.pairs.len() >= MAX_PAIRS {
            return Err(FilterError::MaxReached);
        }
        self.pairs.push(pair);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterPair> {
        self.pairs.iter()
    }

    /// Whether `(apid, ctid)` matches any registered pair using the
    /// four-pattern rule `{(A,C), (*,*), (A,*), (*,C)}`, grounded in
    /// `_process_filter_queue`'s `msg_ctx` match set.
    pub fn matches(&self, apid: FourCc, ctid: FourCc) -> bool {
        let wildcard = FourCc::EMPTY;
        self.pairs.iter().any(|p| {
            (p.apid == apid && p.ctid == ctid)
                || (p.apid == wildcard && p.ctid == wildcard)
                || (p.apid == apid && p.ctid == wildcard)
                || (p.apid == wildcard && p.ctid == ctid)
        })
    }

    pub fn contains(&self, apid: FourCc, ctid: FourCc) -> bool {
        self.pairs.contains(&FilterPair { apid, ctid })
    }
}

impl fmt::Display for FilterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, pair) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "({}, {})", pair.apid, pair.ctid)?;
        }
        write!(f, "]")
    }
}

/// A single ad-hoc match predicate over a decoded message, used by the
/// CLI's `--filter`/`--search` flags and by tests. Distinct from
/// [`FilterSet`]'s fast `(apid, ctid)` routing path.
#[derive(Clone, Debug)]
pub enum Criterion {
    AppId(FourCc),
    ContextId(FourCc),
    LogLevel(LogLevel),
    MessageType(MessageType),
    TimeRange(DateTime<Utc>, DateTime<Utc>),
    TextPattern(Regex),
}

impl Criterion {
    pub fn matches(&self, message: &DltMessage) -> bool {
        match self {
            Criterion::AppId(id) => message.apid() == *id,
            Criterion::ContextId(id) => message.ctid() == *id,
            Criterion::LogLevel(level) => message
                .extended_header
                .map(|h| h.log_level() == *level)
                .unwrap_or(false),
            Criterion::MessageType(mt) => message
                .extended_header
                .map(|h| h.message_type() == *mt)
                .unwrap_or(false),
            Criterion::TimeRange(start, end) => {
                let ts = message.timestamp();
                let dt = DateTime::<Utc>::from_timestamp(ts as i64, 0);
                dt.map(|dt| dt >= *start && dt <= *end).unwrap_or(false)
            }
            Criterion::TextPattern(pattern) => message
                .decode_payload()
                .map(|text| pattern.is_match(&text))
                .unwrap_or(false),
        }
    }
}

/// A conjunction of [`Criterion`]s: a message matches only if every
/// criterion matches, the same "every non-None field narrows the
/// result" semantics as the original's `DLTFilter`/search predicates.
#[derive(Clone, Debug, Default)]
pub struct MessageSubset {
    criteria: Vec<Criterion>,
}

impl MessageSubset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn matches(&self, message: &DltMessage) -> bool {
        self.criteria.iter().all(|c| c.matches(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_set_matches_wildcards() {
        let mut set = FilterSet::new();
        set.add(FourCc::new("APP1"), FourCc::EMPTY).unwrap();
        assert!(set.matches(FourCc::new("APP1"), FourCc::new("ANY1")));
        assert!(!set.matches(FourCc::new("APP2"), FourCc::new("ANY1")));
    }

    #[test]
    fn filter_set_rejects_duplicate_and_overflow() {
        let mut set = FilterSet::new();
        set.add(FourCc::new("APP1"), FourCc::new("CTX1")).unwrap();
        assert!(matches!(
            set.add(FourCc::new("APP1"), FourCc::new("CTX1")),
            Err(FilterError::Duplicate(_, _))
        ));

        let mut full = FilterSet::new();
        for i in 0..MAX_PAIRS {
            full.add(FourCc::new(&format!("A{i:03}")), FourCc::EMPTY)
                .unwrap();
        }
        assert!(matches!(
            full.add(FourCc::new("OVER"), FourCc::EMPTY),
            Err(FilterError::MaxReached)
        ));
    }
}
