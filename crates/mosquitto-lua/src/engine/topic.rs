//! MQTT topic filter matching (`+` and `#` wildcards).

use crate::reason::{EngineError, EngineResult, StatusCode};

/// A subscription filter: `#` only as the whole last level, `+` only as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| {
        let hash_ok = !level.contains('#') || (*level == "#" && i == levels.len() - 1);
        let plus_ok = !level.contains('+') || *level == "+";
        hash_ok && plus_ok
    })
}

/// A publish topic: non-empty, no wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// Whether `topic` matches `filter`. Invalid input is an `Inval` error.
///
/// Topics starting with `$` are never matched by a leading wildcard.
pub fn matches(filter: &str, topic: &str) -> EngineResult<bool> {
    if !is_valid_filter(filter) || !is_valid_topic(topic) {
        return Err(EngineError::new(StatusCode::Inval));
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return Ok(false);
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return Ok(true),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return Ok(true),
            _ => return Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("foo/bar", "foo/bar", true)]
    #[case("foo/+", "foo/bar", true)]
    #[case("foo/+/baz", "foo/bar/baz", true)]
    #[case("foo/#", "foo/bar/baz", true)]
    #[case("foo/#", "foo", true)]
    #[case("#", "foo/bar", true)]
    #[case("+/+", "/finance", true)]
    #[case("foo/+", "foo/bar/baz", false)]
    #[case("foo/bar", "foo", false)]
    #[case("foo", "foo/bar", false)]
    #[case("#", "$SYS/broker", false)]
    #[case("$SYS/#", "$SYS/broker", true)]
    fn test_matching(#[case] filter: &str, #[case] topic: &str, #[case] expected: bool) {
        assert_eq!(matches(filter, topic).unwrap(), expected);
    }

    #[rstest]
    #[case("foo/#/bar")]
    #[case("foo/ba+")]
    #[case("foo#")]
    #[case("")]
    fn test_invalid_filters(#[case] filter: &str) {
        assert!(!is_valid_filter(filter));
        assert_eq!(
            matches(filter, "foo/bar"),
            Err(EngineError::new(StatusCode::Inval))
        );
    }

    #[test]
    fn test_wildcard_topic_rejected() {
        assert!(matches("foo/#", "foo/+").is_err());
    }
}
