//! Topic name and filter validation, and filter matching.

use crate::constants::SHARED_SUBSCRIPTION_PREFIX;
use crate::error::{MqttError, Result};

/// Topic names are what PUBLISH carries: non-empty and free of wildcards.
///
/// # Errors
/// `InvalidTopicName` describing the first violation found.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(MqttError::InvalidTopicName("topic is empty".to_string()));
    }
    if topic.len() > u16::MAX as usize {
        return Err(MqttError::InvalidTopicName(format!(
            "topic is {} bytes long",
            topic.len()
        )));
    }
    if topic.contains(['+', '#']) {
        return Err(MqttError::InvalidTopicName(format!(
            "{topic}: wildcards are not allowed in topic names"
        )));
    }
    if topic.contains('\0') {
        return Err(MqttError::InvalidTopicName(format!(
            "{topic}: contains NUL"
        )));
    }
    Ok(())
}

/// # Errors
/// `InvalidTopicFilter` when the filter is empty, a wildcard shares a level
/// with other characters, `#` is not the final level, or a `$share/` prefix
/// lacks a group or a filter.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    TopicFilter::new(filter).map(drop)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Exact(String),
    Single,
    Multi,
}

/// Filter tokenized once, so matching costs one pass over the topic levels.
///
/// A `$share/<group>/<filter>` subscription keeps its group; matching
/// uses only the part after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    share_group: Option<String>,
    levels: Vec<Level>,
}

impl TopicFilter {
    /// # Errors
    /// Fails if `filter` is not a valid topic filter.
    pub fn new(filter: &str) -> Result<Self> {
        let invalid = |reason: &str| MqttError::InvalidTopicFilter(format!("{filter}: {reason}"));
        if filter.is_empty() {
            return Err(MqttError::InvalidTopicFilter("filter is empty".to_string()));
        }

        let (share_group, matched) = match filter.strip_prefix(SHARED_SUBSCRIPTION_PREFIX) {
            Some(shared) => {
                let Some((group, rest)) = shared.split_once('/') else {
                    return Err(invalid("shared subscription has no filter"));
                };
                if group.is_empty() || group.contains(['+', '#']) {
                    return Err(invalid("invalid share group"));
                }
                if rest.is_empty() {
                    return Err(invalid("shared subscription has no filter"));
                }
                (Some(group.to_string()), rest)
            }
            None => (None, filter),
        };

        let mut levels = Vec::new();
        let mut remaining = matched.split('/').peekable();
        while let Some(level) = remaining.next() {
            let level = match level {
                "+" => Level::Single,
                "#" if remaining.peek().is_none() => Level::Multi,
                _ if level.contains('#') => {
                    return Err(invalid("'#' must be the last level on its own"));
                }
                _ if level.contains('+') => return Err(invalid("'+' must occupy a whole level")),
                exact => Level::Exact(exact.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: filter.to_string(),
            share_group,
            levels,
        })
    }

    /// The filter as registered, including any `$share/<group>/` prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn share_group(&self) -> Option<&str> {
        self.share_group.as_deref()
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.share_group.is_some()
    }

    /// The part of the filter topics are matched against.
    #[must_use]
    pub fn matched_filter(&self) -> &str {
        match &self.share_group {
            Some(group) => &self.raw[SHARED_SUBSCRIPTION_PREFIX.len() + group.len() + 1..],
            None => &self.raw,
        }
    }

    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let starts_with_wildcard = matches!(self.levels.first(), Some(Level::Single | Level::Multi));
        if starts_with_wildcard && topic.starts_with('$') {
            return false;
        }

        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }
        topic_levels.next().is_none()
    }
}

/// Convenience wrapper for one-off matches; invalid filters never match.
#[must_use]
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    TopicFilter::new(filter).is_ok_and(|f| f.matches(topic))
}
