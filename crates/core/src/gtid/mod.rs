//! GTID sets and the consistency checks built on them.
//!
//! A [`GtidSet`] is a snapshot of a server variable (`gtid_executed`,
//! `gtid_purged`) or of a channel's received set. Merging two snapshots is a
//! local operation, but the result is only *normalized* again once a server
//! has coalesced it: subtraction, containment and normalization are always
//! delegated to a live server through [`Instance`], so the server's own
//! comparison semantics decide the outcome.
//!
//! Counting or comparing a set that has not been normalized fails with
//! [`ErrorCode::GtidSetNotNormalized`].

pub mod consistency;
pub mod parser;

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, ErrorCode, Result};
use crate::instance::Instance;
use parser::parse_gtid_set;

/// Inclusive range of transaction numbers from one source.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    /// Number of transactions in the range.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A set of `(source uuid, transaction number)` pairs.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct GtidSet {
    groups: Vec<(String, Vec<Interval>)>,
    normalized: bool,
}

impl Default for GtidSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl GtidSet {
    /// The empty set. Always normalized.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            groups: Vec::new(),
            normalized: true,
        }
    }

    /// Parse text received from a server.
    ///
    /// The set is considered normalized when every source appears once, with
    /// ascending, disjoint, non-adjacent intervals, which is how servers print
    /// `gtid_executed` and the results of `GTID_SUBTRACT`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gtid`] if the text is not a GTID set.
    pub fn parse(text: &str) -> Result<Self> {
        let groups = parse_gtid_set(text)?;
        let normalized = is_canonical(&groups);
        Ok(Self { groups, normalized })
    }

    /// Build a set from groups that are already in canonical form.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::GtidSetNotNormalized`] if the groups are not.
    pub fn from_canonical(groups: Vec<(String, Vec<Interval>)>) -> Result<Self> {
        if !is_canonical(&groups) {
            return Err(Error::new(
                ErrorCode::GtidSetNotNormalized,
                "GTID groups are not in canonical form",
            ));
        }
        Ok(Self {
            groups,
            normalized: true,
        })
    }

    /// Snapshot of `@@GLOBAL.gtid_executed`.
    ///
    /// # Errors
    ///
    /// Fails with the server's (network) error if the instance is unreachable.
    pub fn from_executed(server: &dyn Instance) -> Result<Self> {
        Self::parse(&server.gtid_executed()?)
    }

    /// Snapshot of `@@GLOBAL.gtid_purged`.
    ///
    /// # Errors
    ///
    /// Fails with the server's (network) error if the instance is unreachable.
    pub fn from_purged(server: &dyn Instance) -> Result<Self> {
        Self::parse(&server.gtid_purged()?)
    }

    /// Transactions received (not necessarily applied) by `channel`.
    ///
    /// # Errors
    ///
    /// Fails with the server's (network) error if the instance is unreachable.
    pub fn from_received(server: &dyn Instance, channel: &str) -> Result<Self> {
        Self::parse(&server.received_gtid_set(channel)?)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|(_, intervals)| intervals.is_empty())
    }

    #[must_use]
    pub const fn is_normalized(&self) -> bool {
        self.normalized
    }

    /// Iterate over `(source uuid, intervals)` groups in textual order.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &[Interval])> {
        self.groups
            .iter()
            .map(|(uuid, intervals)| (uuid.as_str(), intervals.as_slice()))
    }

    /// Distinct source UUIDs present in the set.
    #[must_use]
    pub fn sources(&self) -> BTreeSet<&str> {
        self.groups
            .iter()
            .filter(|(_, intervals)| !intervals.is_empty())
            .map(|(uuid, _)| uuid.as_str())
            .collect()
    }

    /// Number of transactions in the set.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::GtidSetNotNormalized`] on an unnormalized set,
    /// whose overlapping ranges would be counted twice.
    pub fn count(&self) -> Result<u64> {
        self.ensure_normalized("count")?;
        Ok(self
            .groups
            .iter()
            .flat_map(|(_, intervals)| intervals.iter())
            .map(Interval::size)
            .sum())
    }

    /// Structural equality of two normalized sets.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::GtidSetNotNormalized`] if either side is not normalized.
    pub fn equals(&self, other: &Self) -> Result<bool> {
        self.ensure_normalized("compare")?;
        other.ensure_normalized("compare")?;
        Ok(self.groups == other.groups)
    }

    /// Union by concatenation. The result needs a server round trip
    /// ([`normalize`](Self::normalize)) before it can be counted or compared,
    /// unless one side was empty.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut groups = self.groups.clone();
        groups.extend(other.groups.iter().cloned());
        Self {
            groups,
            normalized: false,
        }
    }

    /// Restrict the set to transactions originating from `uuid`.
    #[must_use]
    pub fn get_gtids_from(&self, uuid: &str) -> Self {
        let uuid = uuid.to_ascii_lowercase();
        let groups: Vec<_> = self
            .groups
            .iter()
            .filter(|(source, _)| *source == uuid)
            .cloned()
            .collect();
        let normalized = self.normalized || is_canonical(&groups);
        Self { groups, normalized }
    }

    /// Coalesce the set using the server's comparison semantics.
    ///
    /// # Errors
    ///
    /// Propagates server errors.
    pub fn normalize(&self, server: &dyn Instance) -> Result<Self> {
        if self.normalized {
            return Ok(self.clone());
        }
        Self::parse(&server.gtid_subtract(&self.to_string(), "")?)
    }

    /// `self - other`, computed by `server`.
    ///
    /// # Errors
    ///
    /// Propagates server errors.
    pub fn subtract(&self, other: &Self, server: &dyn Instance) -> Result<Self> {
        if self.is_empty() {
            return Ok(Self::empty());
        }
        Self::parse(&server.gtid_subtract(&self.to_string(), &other.to_string())?)
    }

    /// `true` if every transaction of `other` is also in `self`.
    ///
    /// # Errors
    ///
    /// Propagates server errors.
    pub fn contains(&self, other: &Self, server: &dyn Instance) -> Result<bool> {
        if other.is_empty() {
            return Ok(true);
        }
        server.gtid_is_subset(&other.to_string(), &self.to_string())
    }

    /// `self ∩ other`, as `self - (self - other)`.
    ///
    /// # Errors
    ///
    /// Propagates server errors.
    pub fn intersect(&self, other: &Self, server: &dyn Instance) -> Result<Self> {
        let outside = self.subtract(other, server)?;
        self.subtract(&outside, server)
    }

    /// Every single GTID of the set as `uuid:n` text.
    pub fn iter_gtids(&self) -> impl Iterator<Item = String> + '_ {
        self.groups.iter().flat_map(|(uuid, intervals)| {
            intervals
                .iter()
                .flat_map(|i| i.start..=i.end)
                .map(move |n| format!("{uuid}:{n}"))
        })
    }

    fn ensure_normalized(&self, what: &str) -> Result<()> {
        if self.normalized {
            Ok(())
        } else {
            Err(Error::new(
                ErrorCode::GtidSetNotNormalized,
                format!("cannot {what} a GTID set that has not been normalized: {self}"),
            ))
        }
    }
}

fn is_canonical(groups: &[(String, Vec<Interval>)]) -> bool {
    let mut seen = BTreeSet::new();
    groups.iter().all(|(uuid, intervals)| {
        seen.insert(uuid.as_str())
            && !intervals.is_empty()
            && intervals.windows(2).all(|w| w[0].end + 1 < w[1].start)
    })
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.groups {
            if intervals.is_empty() {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(uuid)?;
            for interval in intervals {
                if interval.start == interval.end {
                    write!(f, ":{}", interval.start)?;
                } else {
                    write!(f, ":{}-{}", interval.start, interval.end)?;
                }
            }
        }
        Ok(())
    }
}
