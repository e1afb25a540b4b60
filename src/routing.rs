// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Predicates
//!
//! Matching rules of topic and headers exchanges, used by the in-process
//! broker to decide which bound queues receive a message.

use crate::headers::{HeaderValue, Headers, MatchMode, AMQP_HEADERS_X_MATCH};

/// Whether a topic binding `pattern` accepts the published `routing_key`.
///
/// Both are dot separated words. `*` stands for exactly one word and `#` for
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern = pattern.split('.').collect::<Vec<_>>();
    let key = routing_key.split('.').collect::<Vec<_>>();

    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

/// Match mode carried by binding arguments. Brokers default to `all`.
pub fn binding_mode(arguments: &Headers) -> MatchMode {
    match arguments.get(AMQP_HEADERS_X_MATCH).and_then(HeaderValue::as_str) {
        Some("any") => MatchMode::Any,
        _ => MatchMode::All,
    }
}

/// Whether message `headers` satisfy headers-exchange binding `arguments`.
///
/// Arguments prefixed with `x-` are directives, not criteria. A `Void`
/// criterion only requires the header to be present.
pub fn headers_match(arguments: &Headers, headers: &Headers) -> bool {
    let mut criteria = arguments
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"))
        .map(|(key, expected)| match headers.get(key) {
            Some(_) if *expected == HeaderValue::Void => true,
            Some(actual) => actual == expected,
            None => false,
        });

    match binding_mode(arguments) {
        MatchMode::All => criteria.all(|matched| matched),
        MatchMode::Any => criteria.any(|matched| matched),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::build_match_headers;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), HeaderValue::from(*v)))
            .collect()
    }

    #[test]
    fn should_match_single_word_wildcard() {
        assert!(topic_matches("routingKey.*", "routingKey.test"));
        assert!(!topic_matches("routingKey.*", "routingKey.test.extra"));
        assert!(!topic_matches("routingKey.*", "routingKey"));
        assert!(topic_matches("*.test", "routingKey.test"));
        assert!(!topic_matches("*.test", "other.routingKey.test"));
    }

    #[test]
    fn should_match_multi_word_wildcard() {
        assert!(topic_matches("routingKey.#", "routingKey"));
        assert!(topic_matches("routingKey.#", "routingKey.test.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.test", "other.routingKey.test"));
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(!topic_matches("a.#.z", "a.b.c"));
    }

    #[test]
    fn should_match_exact_words() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
    }

    #[test]
    fn should_require_every_header_with_all() {
        let args = build_match_headers(&headers(&[("account", "new")]), MatchMode::All);

        assert!(headers_match(
            &args,
            &headers(&[("account", "new"), ("extra", "x")])
        ));
        assert!(!headers_match(&args, &headers(&[("account", "old")])));
        assert!(!headers_match(&args, &headers(&[])));
    }

    #[test]
    fn should_require_one_header_with_any() {
        let args = build_match_headers(
            &headers(&[("account", "new"), ("region", "eu")]),
            MatchMode::Any,
        );

        assert!(headers_match(&args, &headers(&[("region", "eu")])));
        assert!(!headers_match(
            &args,
            &headers(&[("account", "old"), ("region", "us")])
        ));
    }

    #[test]
    fn should_default_to_all_without_discriminator() {
        let args = headers(&[("account", "new"), ("region", "eu")]);

        assert_eq!(binding_mode(&args), MatchMode::All);
        assert!(!headers_match(&args, &headers(&[("account", "new")])));
    }

    #[test]
    fn should_treat_void_criterion_as_presence() {
        let args = Headers::from([("account".to_owned(), HeaderValue::Void)]);

        assert!(headers_match(&args, &headers(&[("account", "anything")])));
        assert!(!headers_match(&args, &headers(&[("region", "eu")])));
    }
}
