//! Topic filter validation and direct filter matching

use std::fmt;

/// Why a topic filter was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    Empty,
    /// `#` in a non-terminal position
    MultiWildcardNotLast,
    /// `+` or `#` mixed with other characters in one level
    WildcardInLevel,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty topic filter"),
            Self::MultiWildcardNotLast => write!(f, "'#' must be the last level"),
            Self::WildcardInLevel => write!(f, "wildcard mixed into a topic level"),
        }
    }
}

impl std::error::Error for FilterError {}

/// Validate a subscription topic filter
pub fn validate_topic_filter(filter: &str) -> Result<(), FilterError> {
    if filter.is_empty() {
        return Err(FilterError::Empty);
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" => {
                if levels.peek().is_some() {
                    return Err(FilterError::MultiWildcardNotLast);
                }
            }
            "+" => {}
            _ => {
                if level.contains('#') || level.contains('+') {
                    return Err(FilterError::WildcardInLevel);
                }
            }
        }
    }
    Ok(())
}

/// Match a concrete topic against a single filter.
///
/// Used where building a trie is overkill: retained-store lookup and ACL
/// evaluation. `#`/`+` at the root never match a `$`-prefixed topic.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('#') || filter.starts_with('+')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "a/#" covers "a" itself as well as anything below it
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("foo/bar", "foo/bar", true; "exact")]
    #[test_case("foo/baz", "foo/bar", false; "mismatch")]
    #[test_case("foo/xxx/bar", "foo/+/bar", true; "plus mid")]
    #[test_case("foo/bar", "+/bar", true; "plus head")]
    #[test_case("foo/bar/baz", "foo/+", false; "plus too short")]
    #[test_case("foo/bar", "foo/#", true; "hash child")]
    #[test_case("foo/bar/baz", "foo/#", true; "hash deep")]
    #[test_case("foo", "foo/#", true; "hash zero levels")]
    #[test_case("foo/bar/baz", "#", true; "hash all")]
    #[test_case("$SYS/broker/uptime", "#", false; "dollar not hash")]
    #[test_case("$SYS/broker/uptime", "+/broker/uptime", false; "dollar not plus")]
    #[test_case("$SYS/broker/uptime", "$SYS/#", true; "dollar explicit")]
    fn matching(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }

    #[test]
    fn filter_validation() {
        assert!(validate_topic_filter("a/b/c").is_ok());
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert_eq!(validate_topic_filter(""), Err(FilterError::Empty));
        assert_eq!(
            validate_topic_filter("a/#/b"),
            Err(FilterError::MultiWildcardNotLast)
        );
        assert_eq!(
            validate_topic_filter("a/b#"),
            Err(FilterError::WildcardInLevel)
        );
        assert_eq!(
            validate_topic_filter("a+/b"),
            Err(FilterError::WildcardInLevel)
        );
    }
}
