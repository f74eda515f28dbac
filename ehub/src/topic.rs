//! Topic name and filter rules enforced at the session boundary.

use crate::error::HubError;
use crate::Result;

pub const TOPIC_SEPARATOR: char = '/';
pub const SINGLE_WILDCARD: &str = "+";
pub const MULTIPLE_WILDCARD: &str = "#";
pub const SYS_PREFIX: &str = "$";
pub const MAX_TOPIC_NAME_LEN: usize = 255;
pub const MAX_SLASH_COUNT: usize = 8;

#[inline]
fn check_common(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_NAME_LEN
        && !topic.contains('\u{0}')
        && topic.matches(TOPIC_SEPARATOR).count() <= MAX_SLASH_COUNT
        && !is_sys_topic(topic)
}

#[inline]
pub fn is_sys_topic(topic: &str) -> bool {
    topic.starts_with(SYS_PREFIX)
}

#[inline]
pub fn contains_wildcard(topic: &str) -> bool {
    topic.contains(SINGLE_WILDCARD) || topic.contains(MULTIPLE_WILDCARD)
}

/// Whether `topic` may be used as a publish topic name.
pub fn pub_topic_validate(topic: &str) -> bool {
    check_common(topic) && !contains_wildcard(topic)
}

/// Whether `topic` may be used as a subscription filter.
pub fn sub_topic_validate(topic: &str) -> bool {
    if !check_common(topic) {
        return false;
    }
    let levels: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
    let last = levels.len() - 1;
    for (i, l) in levels.iter().enumerate() {
        if *l == MULTIPLE_WILDCARD {
            if i != last {
                return false;
            }
        } else if l.contains(MULTIPLE_WILDCARD) || (*l != SINGLE_WILDCARD && l.contains(SINGLE_WILDCARD)) {
            return false;
        }
    }
    true
}

#[inline]
pub fn check_pub_topic(topic: &str) -> Result<()> {
    if pub_topic_validate(topic) {
        Ok(())
    } else {
        Err(HubError::InvalidTopic(topic.into()).into())
    }
}

#[inline]
pub fn check_sub_topic(topic: &str) -> Result<()> {
    if sub_topic_validate(topic) {
        Ok(())
    } else {
        Err(HubError::InvalidTopic(topic.into()).into())
    }
}

/// Whether the topic name `topic` matches the filter `filter`.
pub fn is_match(topic: &str, filter: &str) -> bool {
    let mut t = topic.split(TOPIC_SEPARATOR);
    let mut f = filter.split(TOPIC_SEPARATOR);
    loop {
        match (f.next(), t.next()) {
            (Some(MULTIPLE_WILDCARD), _) => return true,
            (Some(SINGLE_WILDCARD), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pub_topic() {
        assert!(pub_topic_validate("a"));
        assert!(pub_topic_validate("a/b/c"));
        assert!(pub_topic_validate("/"));
        assert!(pub_topic_validate(&"/".repeat(8)));
        assert!(!pub_topic_validate(&"/".repeat(9)));
        assert!(!pub_topic_validate(""));
        assert!(!pub_topic_validate("a/+"));
        assert!(!pub_topic_validate("a/#"));
        assert!(!pub_topic_validate("$SYS/a"));
        assert!(!pub_topic_validate("a\u{0}b"));
        assert!(pub_topic_validate(&"a".repeat(255)));
        assert!(!pub_topic_validate(&"a".repeat(256)));
    }

    #[test]
    fn sub_topic() {
        assert!(sub_topic_validate("#"));
        assert!(sub_topic_validate("+"));
        assert!(sub_topic_validate("a/+/b"));
        assert!(sub_topic_validate("a/#"));
        assert!(sub_topic_validate("+/+/#"));
        assert!(!sub_topic_validate("a/#/b"));
        assert!(!sub_topic_validate("a#"));
        assert!(!sub_topic_validate("a/b+"));
        assert!(!sub_topic_validate("$rule/topic"));
        assert!(!sub_topic_validate(""));
        assert!(!sub_topic_validate(&"+/".repeat(9)));
    }

    #[test]
    fn matching() {
        assert!(is_match("a", "#"));
        assert!(is_match("a", "a/#"));
        assert!(is_match("a/b/c", "a/#"));
        assert!(is_match("a/b", "a/+"));
        assert!(!is_match("a/b/c", "a/+"));
        assert!(!is_match("a", "a/+"));
        assert!(is_match("/", "+/+"));
        assert!(!is_match("a/b", "a"));
        assert!(is_match("abc/ldf/rmb/", "abc/+/rmb/"));
    }
}
