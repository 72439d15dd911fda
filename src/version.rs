// src/version.rs

//! Version ordering and constraint predicates
//!
//! Upstream ecosystems disagree on version syntax, so comparison here is
//! deliberately simple and uniform: an optional `epoch:` prefix compares
//! first, then dot-separated tokens compare numerically when both sides
//! are numeric and lexicographically otherwise. RPM tildes and other
//! ecosystem-specific characters are treated as ordinary token text.
//!
//! Predicate grammar, in precedence order:
//! - `,` separates conjuncts: `>=1.1,<2.0`
//! - `|` separates alternatives: `1.0|2.0`
//! - an explicit operator prefix: `>=v`, `<v`, `=v`
//! - a trailing `*` matches by prefix: `3.20*`
//! - anything else is an exact match

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

/// Compare two version strings
///
/// An optional numeric `epoch:` prefix dominates; the remainder splits on
/// `.` with numeric segments compared numerically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (epoch_a, rest_a) = split_epoch(a);
    let (epoch_b, rest_b) = split_epoch(b);

    match epoch_a.cmp(&epoch_b) {
        Ordering::Equal => {}
        ord => return ord,
    }

    let tokens_a: Vec<&str> = rest_a.split('.').collect();
    let tokens_b: Vec<&str> = rest_b.split('.').collect();

    for i in 0..tokens_a.len().max(tokens_b.len()) {
        let ta = tokens_a.get(i).copied().unwrap_or("");
        let tb = tokens_b.get(i).copied().unwrap_or("");

        let ord = match (ta.parse::<u64>(), tb.parse::<u64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => ta.cmp(tb),
        };

        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

fn split_epoch(v: &str) -> (u64, &str) {
    if let Some((epoch, rest)) = v.split_once(':') {
        if let Ok(e) = epoch.parse::<u64>() {
            return (e, rest);
        }
    }
    (0, v)
}

/// Extract the build epoch of a version string, defaulting to zero
pub fn epoch_of(v: &str) -> u64 {
    split_epoch(v).0
}

/// A version constraint applied by package queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionPredicate {
    /// Any version is acceptable
    Any,
    /// Exact match
    Exact(String),
    /// Greater than or equal
    GreaterOrEqual(String),
    /// Strictly less than
    LessThan(String),
    /// Version string starts with the given prefix
    Prefix(String),
    /// Satisfied when any alternative is satisfied
    Or(Vec<VersionPredicate>),
    /// Satisfied when every conjunct is satisfied
    And(Vec<VersionPredicate>),
}

impl VersionPredicate {
    /// Parse a predicate string
    ///
    /// Examples: `>=1.1,<2.0`, `1.0|2.0`, `3.20*`, `=1.5.0`, `*`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        if s.is_empty() || s == "*" {
            return Ok(VersionPredicate::Any);
        }

        if s.contains(',') {
            let conjuncts = s
                .split(',')
                .map(|part| Self::parse(part))
                .collect::<Result<Vec<_>>>()?;
            return Ok(VersionPredicate::And(conjuncts));
        }

        if s.contains('|') {
            let alternatives = s
                .split('|')
                .map(|part| Self::parse(part))
                .collect::<Result<Vec<_>>>()?;
            return Ok(VersionPredicate::Or(alternatives));
        }

        if let Some(rest) = s.strip_prefix(">=") {
            Ok(VersionPredicate::GreaterOrEqual(parse_version(rest)?))
        } else if let Some(rest) = s.strip_prefix('<') {
            Ok(VersionPredicate::LessThan(parse_version(rest)?))
        } else if let Some(rest) = s.strip_prefix('=') {
            // `=1.2*` is still a prefix match; `=` only pins the operator.
            if let Some(prefix) = rest.strip_suffix('*') {
                Ok(VersionPredicate::Prefix(prefix.trim().to_string()))
            } else {
                Ok(VersionPredicate::Exact(parse_version(rest)?))
            }
        } else if let Some(prefix) = s.strip_suffix('*') {
            Ok(VersionPredicate::Prefix(prefix.trim().to_string()))
        } else {
            Ok(VersionPredicate::Exact(parse_version(s)?))
        }
    }

    /// Check whether a version satisfies this predicate
    pub fn matches(&self, version: &str) -> bool {
        match self {
            VersionPredicate::Any => true,
            VersionPredicate::Exact(v) => compare_versions(version, v) == Ordering::Equal,
            VersionPredicate::GreaterOrEqual(v) => compare_versions(version, v) != Ordering::Less,
            VersionPredicate::LessThan(v) => compare_versions(version, v) == Ordering::Less,
            VersionPredicate::Prefix(p) => version.starts_with(p.as_str()),
            VersionPredicate::Or(alts) => alts.iter().any(|alt| alt.matches(version)),
            VersionPredicate::And(conjuncts) => conjuncts.iter().all(|c| c.matches(version)),
        }
    }

    /// True when this predicate accepts every version
    pub fn is_any(&self) -> bool {
        matches!(self, VersionPredicate::Any)
    }
}

fn parse_version(s: &str) -> Result<String> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Parse {
            what: "version predicate".into(),
            reason: "empty version after operator".into(),
        });
    }
    Ok(s.to_string())
}

impl fmt::Display for VersionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionPredicate::Any => write!(f, "*"),
            VersionPredicate::Exact(v) => write!(f, "={}", v),
            VersionPredicate::GreaterOrEqual(v) => write!(f, ">={}", v),
            VersionPredicate::LessThan(v) => write!(f, "<{}", v),
            VersionPredicate::Prefix(p) => write!(f, "{}*", p),
            VersionPredicate::Or(alts) => {
                for (i, alt) in alts.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{}", alt)?;
                }
                Ok(())
            }
            VersionPredicate::And(conjuncts) => {
                for (i, c) in conjuncts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", c)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments_compare_numerically() {
        assert_eq!(compare_versions("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(compare_versions("2.0", "1.99"), Ordering::Greater);
    }

    #[test]
    fn test_mixed_segments_compare_lexicographically() {
        assert_eq!(compare_versions("1.2a", "1.2b"), Ordering::Less);
        assert_eq!(compare_versions("1.2-r1", "1.2-r1"), Ordering::Equal);
    }

    #[test]
    fn test_shorter_version_is_less() {
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
    }

    #[test]
    fn test_epoch_dominates() {
        assert_eq!(compare_versions("1:1.0", "2.0"), Ordering::Greater);
        assert_eq!(epoch_of("2:1.2.3"), 2);
        assert_eq!(epoch_of("1.2.3"), 0);
    }

    #[test]
    fn test_exact_predicate() {
        let p = VersionPredicate::parse("1.2.3").unwrap();
        assert!(p.matches("1.2.3"));
        assert!(!p.matches("1.2.4"));
    }

    #[test]
    fn test_range_predicate() {
        let p = VersionPredicate::parse(">=1.1,<2.0").unwrap();
        assert!(p.matches("1.2"));
        assert!(p.matches("1.1"));
        assert!(!p.matches("1.0"));
        assert!(!p.matches("2.0"));
    }

    #[test]
    fn test_prefix_predicate() {
        let p = VersionPredicate::parse("3.20*").unwrap();
        assert!(p.matches("3.20"));
        assert!(p.matches("3.20.1"));
        assert!(!p.matches("3.21"));
    }

    #[test]
    fn test_alternation_predicate() {
        let p = VersionPredicate::parse("1.0|2.0").unwrap();
        assert!(p.matches("1.0"));
        assert!(p.matches("2.0"));
        assert!(!p.matches("1.5"));
    }

    #[test]
    fn test_any_predicate() {
        let p = VersionPredicate::parse("*").unwrap();
        assert!(p.matches("99.99"));
        assert!(p.is_any());

        let p = VersionPredicate::parse("").unwrap();
        assert!(p.is_any());
    }

    #[test]
    fn test_operator_overrides_star() {
        // An explicit operator wins over any trailing characters.
        let p = VersionPredicate::parse(">=1.1").unwrap();
        assert_eq!(p, VersionPredicate::GreaterOrEqual("1.1".into()));
    }

    #[test]
    fn test_empty_after_operator_rejected() {
        assert!(VersionPredicate::parse(">=").is_err());
        assert!(VersionPredicate::parse("<").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for text in [">=1.1,<2.0", "1.0|2.0", "3.20*", "=1.5.0", "*"] {
            let p = VersionPredicate::parse(text).unwrap();
            let again = VersionPredicate::parse(&p.to_string()).unwrap();
            assert_eq!(p, again, "{} did not round trip", text);
        }
    }

    #[test]
    fn test_tilde_is_ordinary_text() {
        // RPM pre-release tildes are not special-cased.
        assert_eq!(compare_versions("1.0~rc1", "1.0~rc2"), Ordering::Less);
    }
}
