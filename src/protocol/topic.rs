//! Topic name and topic filter validation plus MQTT wildcard matching

use thiserror::Error;

/// Topic strings are length-prefixed with a u16 on the wire
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// Topic validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic is {0} bytes, longer than the 65535 byte limit")]
    TooLong(usize),
    #[error("Topic contains a NUL character")]
    NullCharacter,
    #[error("Invalid wildcard placement in filter '{0}'")]
    InvalidWildcard(String),
    #[error("Topic name '{0}' must not contain wildcards")]
    WildcardInTopicName(String),
}

fn check_common(value: &str) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(TopicError::Empty);
    }
    if value.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong(value.len()));
    }
    if value.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    Ok(())
}

/// Validate a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

/// Validate a subscription filter.
///
/// `+` must occupy a whole level; `#` must occupy a whole level and be the last one.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        let valid = match level {
            "#" => is_last,
            "+" => true,
            other => !other.contains(['+', '#']),
        };
        if !valid {
            return Err(TopicError::InvalidWildcard(filter.to_string()));
        }
    }
    Ok(())
}

/// Returns true when `topic` matches `filter`.
///
/// Both arguments are expected to be valid; matching is case-sensitive and
/// filters that start with a wildcard never match `$`-prefixed topics.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn literal_filter_matches_itself(topic in "[a-zA-Z0-9_-]{1,8}(/[a-zA-Z0-9_-]{0,8}){0,5}") {
            prop_assert!(validate_topic_name(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
            prop_assert!(matches(&topic, &topic), "literal filter should match itself: {}", topic);
        }

        #[test]
        fn hash_matches_every_regular_topic(topic in "[a-zA-Z0-9_-]{1,8}(/[a-zA-Z0-9_-]{0,8}){0,5}") {
            prop_assert!(matches("#", &topic));
        }

        #[test]
        fn plus_per_level_matches_same_depth_only(
            levels in proptest::collection::vec("[a-z0-9]{1,6}", 1..6)
        ) {
            let topic = levels.join("/");
            let filter = vec!["+"; levels.len()].join("/");
            prop_assert!(matches(&filter, &topic), "{} should match {}", filter, topic);

            let deeper = format!("{topic}/extra");
            prop_assert!(!matches(&filter, &deeper), "{} should not match {}", filter, deeper);
        }

        #[test]
        fn wildcards_never_valid_in_topic_names(
            prefix in "[a-z]{0,5}",
            wildcard in "[+#]",
            suffix in "[a-z/]{0,5}"
        ) {
            let topic = format!("{prefix}{wildcard}{suffix}");
            prop_assert!(validate_topic_name(&topic).is_err(), "topic name should be rejected: {}", topic);
        }
    }

    #[test]
    fn test_factory_examples() {
        assert!(matches("factory/+/+/telemetry", "factory/B7/line3/telemetry"));
        assert!(!matches("factory/+/+/telemetry", "factory/B7/telemetry"));
        assert!(matches("factory/#", "factory/B7/line3/telemetry"));
        assert!(matches("factory/#", "factory/B7"));
        assert!(matches("factory/+/+/state", "factory/A1/press2/state"));
        assert!(!matches("factory/+/+/state", "factory/A1/press2/telemetry"));
    }

    #[test]
    fn test_hash_matches_parent_level() {
        // "sport/#" also matches "sport"
        assert!(matches("factory/#", "factory"));
        assert!(!matches("factory/#", "factoryB7"));
    }

    #[test]
    fn test_empty_levels_are_significant() {
        assert!(matches("factory/+", "factory/"));
        assert!(matches("+/+", "/finance"));
        assert!(!matches("+", "/finance"));
        assert!(matches("/+", "/finance"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        assert!(!matches("Factory/+", "factory/B7"));
        assert!(!matches("factory/b7", "factory/B7"));
    }

    #[test]
    fn test_dollar_topics_hidden_from_leading_wildcards() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
        assert!(matches("$SYS/+/uptime", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_topic_filter("factory/+/+/telemetry").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("factory/#").is_ok());
        assert!(validate_topic_filter("/").is_ok());

        assert_eq!(validate_topic_filter(""), Err(TopicError::Empty));
        assert_eq!(
            validate_topic_filter("factory/#/state"),
            Err(TopicError::InvalidWildcard("factory/#/state".to_string()))
        );
        assert!(validate_topic_filter("factory/line#").is_err());
        assert!(validate_topic_filter("factory/li+ne/state").is_err());
        assert_eq!(
            validate_topic_filter("a\0b"),
            Err(TopicError::NullCharacter)
        );
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("factory/B7/line3/telemetry").is_ok());
        assert!(validate_topic_name("$SYS/broker").is_ok());
        assert_eq!(validate_topic_name(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_topic_name("factory/+/state"),
            Err(TopicError::WildcardInTopicName(_))
        ));

        let long = "a".repeat(MAX_TOPIC_LENGTH + 1);
        assert_eq!(
            validate_topic_name(&long),
            Err(TopicError::TooLong(MAX_TOPIC_LENGTH + 1))
        );
    }
}
