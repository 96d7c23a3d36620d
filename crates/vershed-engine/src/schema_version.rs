//! Maturity-aware ordering of schema version names.
//!
//! Version names follow the `v<major>`, `v<major>beta<minor>`,
//! `v<major>alpha<minor>` convention. Ranking is by maturity tier first
//! (stable > beta > alpha), then major number, then minor number, all with
//! higher numbers ranking higher. Names that do not parse rank below every
//! conforming name and compare lexicographically among themselves, so the
//! order is total over arbitrary strings.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MaturityTier
// ---------------------------------------------------------------------------

/// Maturity tier of a schema version. Derived `Ord`: `Alpha < Beta < Stable`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MaturityTier {
    Alpha,
    Beta,
    Stable,
}

impl MaturityTier {
    /// Stable string tag for structured events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Stable => "stable",
        }
    }
}

impl fmt::Display for MaturityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// VersionRank
// ---------------------------------------------------------------------------

/// Total ranking of a version name.
///
/// `Conforming` ranks carry the parsed maturity and numbers; any
/// `NonConforming` rank sorts below every conforming one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionRank {
    NonConforming { name: String },
    Conforming { tier: MaturityTier, major: u32, minor: u32 },
}

impl VersionRank {
    pub fn is_conforming(&self) -> bool {
        matches!(self, Self::Conforming { .. })
    }
}

impl Ord for VersionRank {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::NonConforming { name: a }, Self::NonConforming { name: b }) => a.cmp(b),
            (Self::NonConforming { .. }, Self::Conforming { .. }) => Ordering::Less,
            (Self::Conforming { .. }, Self::NonConforming { .. }) => Ordering::Greater,
            (
                Self::Conforming { tier: ta, major: ma, minor: na },
                Self::Conforming { tier: tb, major: mb, minor: nb },
            ) => ta.cmp(tb).then(ma.cmp(mb)).then(na.cmp(nb)),
        }
    }
}

impl PartialOrd for VersionRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Rank a version name. Never fails; unparseable names get the bottom tier.
pub fn version_rank(name: &str) -> VersionRank {
    match parse_conforming(name) {
        Some((tier, major, minor)) => VersionRank::Conforming { tier, major, minor },
        None => VersionRank::NonConforming {
            name: name.to_string(),
        },
    }
}

/// Compare two version names under the maturity ordering.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_rank(a).cmp(&version_rank(b))
}

/// True when `name` ranks strictly below `reference`.
pub fn ranks_below(name: &str, reference: &str) -> bool {
    compare_versions(name, reference) == Ordering::Less
}

fn parse_conforming(name: &str) -> Option<(MaturityTier, u32, u32)> {
    let rest = name.strip_prefix('v')?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let major: u32 = rest[..digits_end].parse().ok()?;
    let suffix = &rest[digits_end..];
    if suffix.is_empty() {
        return Some((MaturityTier::Stable, major, 0));
    }
    let (tier, minor_str) = if let Some(m) = suffix.strip_prefix("alpha") {
        (MaturityTier::Alpha, m)
    } else if let Some(m) = suffix.strip_prefix("beta") {
        (MaturityTier::Beta, m)
    } else {
        return None;
    };
    if minor_str.is_empty() || !minor_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let minor: u32 = minor_str.parse().ok()?;
    Some((tier, major, minor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
