//! Server-side GTID arithmetic.
//!
//! The orchestration core never computes `GTID_SUBTRACT` or `GTID_SUBSET`
//! itself, it asks a server. [`Gtids`] is what the simulated servers answer
//! with: per source UUID, a list of disjoint, non-adjacent inclusive ranges,
//! always printed in the canonical server format.

use std::collections::BTreeMap;
use std::fmt;

use clusterset_core::GtidSet;
use serde::{Deserialize, Serialize};

/// A normalized GTID set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Gtids(BTreeMap<String, Vec<(u64, u64)>>);

impl Gtids {
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parse server text. Sources are lowercased, ranges merged.
    ///
    /// # Errors
    ///
    /// The parser's error if `text` is not a GTID set.
    pub fn parse(text: &str) -> clusterset_core::Result<Self> {
        let set = GtidSet::parse(text)?;
        let mut gtids = Self::new();
        for (uuid, intervals) in set.groups() {
            for interval in intervals {
                gtids.insert_range(uuid, interval.start, interval.end);
            }
        }
        Ok(gtids)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, uuid: &str, number: u64) {
        self.insert_range(uuid, number, number);
    }

    pub fn insert_range(&mut self, uuid: &str, start: u64, end: u64) {
        let ranges = self.0.entry(uuid.to_ascii_lowercase()).or_default();
        ranges.push((start.min(end), start.max(end)));
        *ranges = merge(core::mem::take(ranges));
    }

    #[must_use]
    pub fn contains(&self, uuid: &str, number: u64) -> bool {
        self.0
            .get(&uuid.to_ascii_lowercase())
            .is_some_and(|ranges| ranges.iter().any(|&(s, e)| s <= number && number <= e))
    }

    /// The number the next transaction of `uuid` gets.
    #[must_use]
    pub fn next(&self, uuid: &str) -> u64 {
        self.0
            .get(&uuid.to_ascii_lowercase())
            .and_then(|ranges| ranges.last())
            .map_or(1, |&(_, end)| end + 1)
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (uuid, ranges) in &other.0 {
            for &(start, end) in ranges {
                out.insert_range(uuid, start, end);
            }
        }
        out
    }

    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        let mut out = BTreeMap::new();
        for (uuid, ranges) in &self.0 {
            let remaining = match other.0.get(uuid) {
                Some(holes) => ranges
                    .iter()
                    .flat_map(|&range| cut(range, holes))
                    .collect(),
                None => ranges.clone(),
            };
            if !remaining.is_empty() {
                out.insert(uuid.clone(), remaining);
            }
        }
        Self(out)
    }

    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        self.subtract(&self.subtract(other))
    }

    /// `self ⊆ other`
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.subtract(other).is_empty()
    }

    /// Single GTIDs, in source then number order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.0
            .iter()
            .flat_map(|(uuid, ranges)| ranges.iter().flat_map(move |&(s, e)| (s..=e).map(move |n| (uuid.as_str(), n))))
    }
}

/// Sort and coalesce overlapping or adjacent ranges.
fn merge(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match out.last_mut() {
            Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
            _ => out.push((start, end)),
        }
    }
    out
}

/// `range` minus every hole.
fn cut(range: (u64, u64), holes: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut pieces = vec![range];
    for &(hs, he) in holes {
        pieces = pieces
            .into_iter()
            .flat_map(|(s, e)| {
                if he < s || hs > e {
                    return vec![(s, e)];
                }
                let mut left = Vec::with_capacity(2);
                if hs > s {
                    left.push((s, hs - 1));
                }
                if he < e {
                    left.push((he + 1, e));
                }
                left
            })
            .collect();
    }
    pieces
}

impl fmt::Display for Gtids {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (uuid, ranges)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",\n")?;
            }
            f.write_str(uuid)?;
            for &(start, end) in ranges {
                if start == end {
                    write!(f, ":{start}")?;
                } else {
                    write!(f, ":{start}-{end}")?;
                }
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for Gtids {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::parse(&text).map_err(|err| err.to_string())
    }
}

impl From<Gtids> for String {
    fn from(gtids: Gtids) -> Self {
        gtids.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    fn gtids(text: &str) -> Gtids {
        Gtids::parse(text).expect("valid gtid set")
    }

    #[test]
    fn ranges_coalesce() {
        let mut set = Gtids::new();
        set.insert(A, 3);
        set.insert(A, 1);
        set.insert(A, 2);
        set.insert(A, 7);
        assert_eq!(set.to_string(), format!("{A}:1-3:7"));
        assert_eq!(set.next(A), 8);
        assert_eq!(set.next(B), 1);
    }

    #[test]
    fn subtract_splits_ranges() {
        let all = gtids(&format!("{A}:1-10,{B}:1-2"));
        let some = gtids(&format!("{A}:3-4:8,{B}:1-2"));
        assert_eq!(all.subtract(&some).to_string(), format!("{A}:1-2:5-7:9-10"));
        assert!(some.is_subset(&all));
        assert!(!all.is_subset(&some));
        assert_eq!(all.intersect(&some), some);
    }

    #[test]
    fn uppercase_sources_match() {
        let upper = gtids(&format!("{}:1-5", A.to_ascii_uppercase()));
        assert!(upper.contains(A, 5));
        assert!(upper.subtract(&gtids(&format!("{A}:1-5"))).is_empty());
    }

    #[test]
    fn serializes_as_text() {
        let set = gtids(&format!("{A}:1-3,{B}:5"));
        let json = serde_json::to_string(&set).expect("serializable");
        assert_eq!(json, format!("\"{A}:1-3,\\n{B}:5\""));
        let back: Gtids = serde_json::from_str(&json).expect("deserializable");
        assert_eq!(back, set);
    }
}
