//! Pub/sub topic encoding.
//!
//! A broadcast topic is `<message_type><END>`; an addressed topic is
//! `<message_type><DELIM><target><END>`. `END` and `DELIM` are distinct
//! single-byte sentinels, so a prefix subscription to `<type><END>` can never
//! match an addressed `<type><DELIM>...` topic and vice versa.

/// Terminates every topic.
pub const TOPIC_END: char = '\u{0003}';
/// Separates the message type from an address qualifier.
pub const TOPIC_DELIMITER: char = '\u{001F}';

/// Encode the topic for a message, optionally addressed to a service id or
/// service type.
pub fn encode(message_type: &str, target: Option<&str>) -> String {
    match target {
        Some(target) => format!("{message_type}{TOPIC_DELIMITER}{target}{TOPIC_END}"),
        None => format!("{message_type}{TOPIC_END}"),
    }
}

/// The subscription prefix matching broadcast messages of one type.
pub fn broadcast_subscription(message_type: &str) -> String {
    encode(message_type, None)
}

/// The subscription prefix matching messages of one type addressed to one
/// target.
pub fn addressed_subscription(message_type: &str, target: &str) -> String {
    encode(message_type, Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_prefix_does_not_match_addressed_topic() {
        let broadcast_sub = broadcast_subscription("command");
        let addressed_topic = encode("command", Some("svc-1"));
        assert!(!addressed_topic.starts_with(&broadcast_sub));
    }

    #[test]
    fn addressed_prefix_matches_only_its_target() {
        let sub = addressed_subscription("command", "svc-1");
        assert!(encode("command", Some("svc-1")).starts_with(&sub));
        assert!(!encode("command", Some("svc-2")).starts_with(&sub));
        assert!(!encode("command", None).starts_with(&sub));
    }

    #[test]
    fn type_prefix_collisions_are_impossible() {
        // "credit" must not catch "credit_drop" topics.
        let sub = broadcast_subscription("credit");
        assert!(!encode("credit_drop", None).starts_with(&sub));
    }
}
