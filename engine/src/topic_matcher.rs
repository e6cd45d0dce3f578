// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use codec::{PubTopic, SubTopic};

/// Checks a topic filter for structural validity: `#` may only appear as the final
/// level, and both `#`/`+` must occupy a whole level, never share one with other
/// characters.
#[must_use]
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.len() > 1 && (level.contains('#') || level.contains('+')) {
            return false;
        }
        if *level == "#" && index != levels.len() - 1 {
            return false;
        }
    }
    true
}

/// Tests whether `topic` matches `filter` under MQTT wildcard rules.
///
/// `+` matches exactly one topic level, `#` matches the rest of the topic including
/// zero remaining levels. A filter starting with `+` or `#` never matches a topic whose
/// first level starts with `$`, reserving the `$`-prefixed namespace for broker-internal
/// topics such as `$SYS`.
#[must_use]
pub fn matches(filter: &SubTopic, topic: &PubTopic) -> bool {
    matches_str(filter.as_ref(), topic.as_ref())
}

#[must_use]
pub fn matches_str(filter: &str, topic: &str) -> bool {
    if !is_valid_filter(filter) {
        return false;
    }
    let topic_is_dollar = topic.starts_with('$');
    let filter_starts_wild = filter.starts_with('+') || filter.starts_with('#');
    if topic_is_dollar && filter_starts_wild {
        return false;
    }

    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();
    match_levels(&filter_levels, &topic_levels)
}

fn match_levels(filter: &[&str], topic: &[&str]) -> bool {
    match (filter.first(), topic.first()) {
        (Some(&"#"), _) => true,
        (Some(&"+"), Some(t)) if !t.is_empty() => match_levels(&filter[1..], &topic[1..]),
        (Some(f), Some(t)) if *f == *t => match_levels(&filter[1..], &topic[1..]),
        (None, None) => true,
        _ => false,
    }
}

/// Whether `filter` contains any wildcard level, used to gate use of a wildcard
/// subscription against the broker's advertised `WildcardSubscriptionAvailable`.
#[must_use]
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches_str("a/b/c", "a/b/c"));
        assert!(!matches_str("a/b/c", "a/b/d"));
    }

    #[test]
    fn test_plus_wildcard_matches_one_level() {
        assert!(matches_str("a/+/c", "a/b/c"));
        assert!(!matches_str("a/+/c", "a/b/x/c"));
    }

    #[test]
    fn test_plus_wildcard_rejects_empty_level() {
        assert!(!matches_str("a/+/c", "a//c"));
    }

    #[test]
    fn test_is_wildcard_filter() {
        assert!(is_wildcard_filter("a/+/c"));
        assert!(is_wildcard_filter("a/#"));
        assert!(!is_wildcard_filter("a/b/c"));
    }

    #[test]
    fn test_hash_wildcard_matches_remainder() {
        assert!(matches_str("a/#", "a/b/c"));
        assert!(matches_str("a/#", "a"));
        assert!(!matches_str("a/#", "b/c"));
    }

    #[test]
    fn test_dollar_topics_excluded_from_leading_wildcards() {
        assert!(!matches_str("#", "$SYS/stats"));
        assert!(!matches_str("+/stats", "$SYS/stats"));
        assert!(matches_str("$SYS/#", "$SYS/stats"));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        assert!(!is_valid_filter("a/#/b"));
        assert!(!is_valid_filter("a/b#"));
        assert!(!is_valid_filter(""));
    }
}
