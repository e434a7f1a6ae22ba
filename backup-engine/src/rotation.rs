//! Time rotation of timestamped items.
//!
//! Every function takes a timeline (items keyed by their instant) and returns a
//! new one; inputs are never modified. Retention policies are expressed as a
//! union of "keep" timelines, and everything else in the full timeline is the
//! deletion set.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

pub type Timeline<T> = BTreeMap<DateTime<Utc>, T>;

/// Parse names of the form `<prefix><RFC 3339 instant><suffix>`.
///
/// Names that don't carry the prefix and suffix, or whose remainder is not a
/// valid instant, are dropped with a warning.
pub fn parse<I, S>(names: I, prefix: &str, suffix: &str) -> Timeline<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut timeline = Timeline::new();
    for name in names {
        let name = name.as_ref();
        match parse_instant(name, prefix, suffix) {
            Some(instant) => {
                timeline.insert(instant, name.to_string());
            }
            None => warn!("Ignoring unparseable rotation name '{}'", name),
        }
    }
    timeline
}

/// Instant embedded in a single name, if any.
pub fn parse_instant(name: &str, prefix: &str, suffix: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Earliest item of every calendar day in `tz`.
pub fn first_of_each_day<T: Clone, Tz: TimeZone>(timeline: &Timeline<T>, tz: &Tz) -> Timeline<T> {
    first_of_each_bucket(timeline, |instant| {
        let local = instant.with_timezone(tz);
        (local.year(), local.ordinal())
    })
}

/// Earliest item of every calendar month in `tz`.
pub fn first_of_each_month<T: Clone, Tz: TimeZone>(timeline: &Timeline<T>, tz: &Tz) -> Timeline<T> {
    first_of_each_bucket(timeline, |instant| {
        let local = instant.with_timezone(tz);
        (local.year(), local.month())
    })
}

fn first_of_each_bucket<T, K, F>(timeline: &Timeline<T>, bucket: F) -> Timeline<T>
where
    T: Clone,
    K: Eq + std::hash::Hash,
    F: Fn(&DateTime<Utc>) -> K,
{
    let mut seen = HashSet::new();
    // BTreeMap iterates oldest first, so the first hit per bucket is the earliest.
    timeline
        .iter()
        .filter(|(instant, _)| seen.insert(bucket(*instant)))
        .map(|(instant, item)| (*instant, item.clone()))
        .collect()
}

/// The `n` most recent items.
pub fn last_n<T: Clone>(timeline: &Timeline<T>, n: usize) -> Timeline<T> {
    timeline
        .iter()
        .rev()
        .take(n)
        .map(|(instant, item)| (*instant, item.clone()))
        .collect()
}

/// Items strictly after `threshold`.
pub fn newer_than<T: Clone>(timeline: &Timeline<T>, threshold: DateTime<Utc>) -> Timeline<T> {
    timeline
        .iter()
        .filter(|(instant, _)| **instant > threshold)
        .map(|(instant, item)| (*instant, item.clone()))
        .collect()
}

/// Copy of `timeline` without the given instants.
pub fn difference<'a, T, I>(timeline: &Timeline<T>, keys: I) -> Timeline<T>
where
    T: Clone,
    I: IntoIterator<Item = &'a DateTime<Utc>>,
{
    let mut result = timeline.clone();
    for key in keys {
        result.remove(key);
    }
    result
}

/// Union of several timelines.
pub fn union<T: Clone>(timelines: &[&Timeline<T>]) -> Timeline<T> {
    let mut result = Timeline::new();
    for timeline in timelines {
        for (instant, item) in timeline.iter() {
            result.entry(*instant).or_insert_with(|| item.clone());
        }
    }
    result
}

/// Everything in `all` that no keep-set retains.
pub fn deletion_set<T: Clone>(all: &Timeline<T>, keeps: &[&Timeline<T>]) -> Timeline<T> {
    let kept = union(keeps);
    difference(all, kept.keys())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn timeline(stamps: &[&str]) -> Timeline<String> {
        stamps.iter().map(|s| (at(s), s.to_string())).collect()
    }

    #[test]
    fn test_parse_strips_prefix_and_suffix() {
        let names = vec![
            "fb-backup_2024-03-01T02:00:00.000Z.sql.zst",
            "fb-backup_not-a-date.sql.zst",
            "other_2024-03-01T02:00:00.000Z.sql.zst",
            "fb-backup_2024-03-02T02:00:00Z.sql.zst",
        ];
        let parsed = parse(names, "fb-backup_", ".sql.zst");
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[&at("2024-03-01T02:00:00Z")],
            "fb-backup_2024-03-01T02:00:00.000Z.sql.zst"
        );
    }

    #[test]
    fn test_first_of_each_day_keeps_earliest() {
        let all = timeline(&[
            "2024-03-01T01:00:00Z",
            "2024-03-01T05:00:00Z",
            "2024-03-02T23:00:00Z",
            "2024-03-02T00:30:00Z",
            "2024-03-05T12:00:00Z",
        ]);
        let firsts = first_of_each_day(&all, &Utc);
        assert_eq!(firsts.len(), 3);
        assert!(firsts.contains_key(&at("2024-03-01T01:00:00Z")));
        assert!(firsts.contains_key(&at("2024-03-02T00:30:00Z")));
        assert!(firsts.contains_key(&at("2024-03-05T12:00:00Z")));
    }

    #[test]
    fn test_first_of_each_day_honours_timezone() {
        // 23:30 UTC on the 1st is already the 2nd in UTC+02:00.
        let all = timeline(&["2024-03-01T20:00:00Z", "2024-03-01T23:30:00Z"]);
        assert_eq!(first_of_each_day(&all, &Utc).len(), 1);
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(first_of_each_day(&all, &plus_two).len(), 2);
    }

    #[test]
    fn test_first_of_each_month() {
        let all = timeline(&[
            "2024-01-31T10:00:00Z",
            "2024-01-03T10:00:00Z",
            "2024-02-15T10:00:00Z",
            "2024-02-01T10:00:00Z",
        ]);
        let firsts = first_of_each_month(&all, &Utc);
        assert_eq!(
            firsts.keys().cloned().collect::<Vec<_>>(),
            vec![at("2024-01-03T10:00:00Z"), at("2024-02-01T10:00:00Z")]
        );
    }

    #[test]
    fn test_last_n() {
        let all = timeline(&[
            "2024-03-01T00:00:00Z",
            "2024-03-02T00:00:00Z",
            "2024-03-03T00:00:00Z",
        ]);
        let last_two = last_n(&all, 2);
        assert_eq!(
            last_two.keys().cloned().collect::<Vec<_>>(),
            vec![at("2024-03-02T00:00:00Z"), at("2024-03-03T00:00:00Z")]
        );
        assert_eq!(last_n(&all, 10).len(), 3);
        assert!(last_n(&all, 0).is_empty());
    }

    #[test]
    fn test_newer_than_is_strict() {
        let all = timeline(&["2024-03-01T00:00:00Z", "2024-03-02T00:00:00Z"]);
        let newer = newer_than(&all, at("2024-03-01T00:00:00Z"));
        assert_eq!(newer.len(), 1);
        assert!(newer.contains_key(&at("2024-03-02T00:00:00Z")));
    }

    #[test]
    fn test_deletion_set_is_all_minus_union_of_keeps() {
        let base = at("2024-03-01T00:00:00Z");
        let all: Timeline<usize> = (0..10).map(|i| (base + Duration::days(i), i as usize)).collect();
        let recent = last_n(&all, 3);
        let monthly = first_of_each_month(&all, &Utc);

        let delete = deletion_set(&all, &[&recent, &monthly]);
        assert_eq!(delete.len(), 6);
        assert!(!delete.contains_key(&base));
        assert!(!delete.contains_key(&(base + Duration::days(9))));
        // Inputs are untouched.
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn test_difference_ignores_unknown_keys() {
        let all = timeline(&["2024-03-01T00:00:00Z"]);
        let unknown = at("2030-01-01T00:00:00Z");
        assert_eq!(difference(&all, [&unknown]).len(), 1);
    }
}
