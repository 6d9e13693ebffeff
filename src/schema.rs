//! Retention schema grammar: `2k24h7d3w11m4y` parses into an ordered vector
//! of `(unit, count)` buckets. Generalizes `zcrab::policy::RetentionPolicy`'s
//! `FromStr`/`Debug`-as-canonical-form idiom from a flat `Vec<RetentionRule>`
//! sorted by period into a fixed-order, fixed-unit-set vector where absent
//! units are explicit zero-count entries rather than missing rules.

use core::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Units in the fixed order the grammar requires them to appear in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Unit {
    /// Keep-days: never destroyed by the planner.
    K,
    H,
    D,
    W,
    M,
    Y,
}

impl Unit {
    pub const ORDER: [Unit; 6] = [Unit::K, Unit::H, Unit::D, Unit::W, Unit::M, Unit::Y];

    fn letter(self) -> char {
        match self {
            Unit::K => 'k',
            Unit::H => 'h',
            Unit::D => 'd',
            Unit::W => 'w',
            Unit::M => 'm',
            Unit::Y => 'y',
        }
    }

    fn from_letter(c: char) -> Option<Unit> {
        match c {
            'k' => Some(Unit::K),
            'h' => Some(Unit::H),
            'd' => Some(Unit::D),
            'w' => Some(Unit::W),
            'm' => Some(Unit::M),
            'y' => Some(Unit::Y),
            _ => None,
        }
    }

    /// Length of a single bucket of this unit, in hours. `k` has no fixed
    /// length of its own; callers that need a span for `k` use `h`'s length
    /// times its count instead (see `retention::bucket_plan`).
    pub fn hours(self) -> i64 {
        match self {
            Unit::K => 24,
            Unit::H => 1,
            Unit::D => 24,
            Unit::W => 24 * 7,
            Unit::M => 24 * 30,
            Unit::Y => 24 * 360,
        }
    }
}

/// One `(unit, count)` pair of the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub unit: Unit,
    pub count: u32,
}

/// A fully parsed retention schema: always exactly six entries, one per
/// `Unit::ORDER`, in order, with zero-count entries for units the string
/// omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema(pub Vec<Bucket>);

impl Schema {
    pub fn count(&self, unit: Unit) -> u32 {
        self.0
            .iter()
            .find(|b| b.unit == unit)
            .map(|b| b.count)
            .unwrap_or(0)
    }
}

impl FromStr for Schema {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut counts = [0u32; 6];
        let mut last_seen: Option<usize> = None;
        let mut digits = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let Some(unit) = Unit::from_letter(c) else {
                return Err(ConfigError::InvalidSchema(format!(
                    "unknown unit letter `{c}` in schema `{s}`"
                )));
            };
            if digits.is_empty() {
                return Err(ConfigError::InvalidSchema(format!(
                    "missing count before `{c}` in schema `{s}`"
                )));
            }
            let count: u32 = digits.parse().map_err(|_| {
                ConfigError::InvalidSchema(format!("count `{digits}` out of range in schema `{s}`"))
            })?;
            digits.clear();

            let idx = Unit::ORDER.iter().position(|u| *u == unit).unwrap();
            if let Some(prev) = last_seen {
                if idx <= prev {
                    return Err(ConfigError::InvalidSchema(format!(
                        "unit `{c}` out of order in schema `{s}`; units must appear in k,h,d,w,m,y order"
                    )));
                }
            }
            last_seen = Some(idx);
            counts[idx] = count;
        }

        if !digits.is_empty() {
            return Err(ConfigError::InvalidSchema(format!(
                "trailing digits `{digits}` with no unit letter in schema `{s}`"
            )));
        }

        Ok(Schema(
            Unit::ORDER
                .iter()
                .zip(counts)
                .map(|(unit, count)| Bucket { unit: *unit, count })
                .collect(),
        ))
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bucket in self.0.iter().filter(|b| b.count > 0) {
            write!(f, "{}{}", bucket.count, bucket.unit.letter())?;
        }
        Ok(())
    }
}
