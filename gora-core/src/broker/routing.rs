//! Routing key matching for topic exchanges.
//!
//! Keys and patterns are `.`-separated words. In a pattern `*` stands for
//! exactly one word and `#` for zero or more words.

use super::channel::ExchangeKind;

/// Returns true if a message published with `routing_key` should be routed
/// through a binding made with `binding_key` on an exchange of type `kind`.
pub fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` swallows 0..=key.len() words
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("cluster.load", "cluster.load"));
        assert!(!topic_matches("cluster.load", "cluster.load.agentA"));
        assert!(!topic_matches("cluster.load", "cluster"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(topic_matches("cluster.*.agentA", "cluster.load.agentA"));
        assert!(!topic_matches("cluster.*", "cluster"));
        assert!(!topic_matches("cluster.*", "cluster.load.agentA"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_words() {
        assert!(topic_matches("cluster.load.#", "cluster.load"));
        assert!(topic_matches("cluster.load.#", "cluster.load.agentA"));
        assert!(topic_matches("cluster.load.#", "cluster.load.a.b.c"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.agentA", "cluster.load.agentA"));
        assert!(!topic_matches("cluster.load.#", "cluster.other"));
    }

    #[test]
    fn test_plain_group_name_as_routing_key() {
        // media agents historically published on their bare group name
        assert!(topic_matches("media@1", "media@1"));
        assert!(topic_matches("#", "media@1"));
    }

    #[test]
    fn test_exchange_kinds() {
        assert!(binding_matches(ExchangeKind::Fanout, "ignored", "x.y"));
        assert!(binding_matches(ExchangeKind::Direct, "x.y", "x.y"));
        assert!(!binding_matches(ExchangeKind::Direct, "x.*", "x.y"));
        assert!(binding_matches(ExchangeKind::Topic, "x.*", "x.y"));
    }
}
