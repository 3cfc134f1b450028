//! Outbound routing: pick the channel that owns a JID, format and split
//! outbound text. Pure functions over the channel set; no state.

use std::sync::Arc;

use crate::channels::Channel;

/// Find the unique channel whose `owns_jid` predicate accepts the JID.
/// Ownership predicates are disjoint by construction, so first match wins.
pub fn find_channel<'a>(
    channels: &'a [Arc<dyn Channel>],
    jid: &str,
) -> Option<&'a Arc<dyn Channel>> {
    channels.iter().find(|c| c.owns_jid(jid))
}

/// Prepend the assistant prefix when not already present. Used only where
/// the persistence layer relies on the prefix as a bot-message backstop;
/// outbound sends stay unprefixed.
pub fn format_outgoing(text: &str, assistant_name: &str) -> String {
    let prefix = format!("{}: ", assistant_name);
    if text.starts_with(&prefix) {
        text.to_string()
    } else {
        format!("{}{}", prefix, text)
    }
}

/// Split text into chunks of at most `max` characters, preserving content
/// exactly: the concatenation of the chunks equals the input.
pub fn split_for_length(text: &str, max: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if max == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        if count == max {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    chunks.push(current);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::StubChannel;

    fn channel_set() -> Vec<Arc<dyn Channel>> {
        vec![
            Arc::new(StubChannel::new("whatsapp", |jid| {
                jid.ends_with("@g.us") || jid.ends_with("@s.whatsapp.net")
            })),
            Arc::new(StubChannel::new("slack", |jid| jid.starts_with("slack:"))),
        ]
    }

    #[test]
    fn find_channel_routes_by_ownership() {
        let channels = channel_set();
        assert_eq!(
            find_channel(&channels, "slack:C0123").unwrap().name(),
            "slack"
        );
        assert_eq!(
            find_channel(&channels, "5551234@g.us").unwrap().name(),
            "whatsapp"
        );
        assert!(find_channel(&channels, "random").is_none());
    }

    #[test]
    fn format_outgoing_prefixes_once() {
        assert_eq!(format_outgoing("hello", "Andy"), "Andy: hello");
        assert_eq!(format_outgoing("Andy: hello", "Andy"), "Andy: hello");
        // A colon without the trailing space is not the prefix.
        assert_eq!(format_outgoing("Andy:hello", "Andy"), "Andy: Andy:hello");
    }

    #[test]
    fn split_for_length_exact_chunks() {
        let text = "a".repeat(10);
        assert_eq!(split_for_length(&text, 4), vec!["aaaa", "aaaa", "aa"]);
        assert_eq!(split_for_length(&text, 10), vec![text.clone()]);
        assert_eq!(split_for_length(&text, 11), vec![text]);
        assert!(split_for_length("", 5).is_empty());
    }

    #[test]
    fn split_for_length_is_utf8_safe() {
        let text = "🦀".repeat(5);
        let chunks = split_for_length(&text, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    mod proptest_split {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn split_concatenation_is_lossless(s in "\\PC{0,300}", max in 1usize..50) {
                let chunks = split_for_length(&s, max);
                prop_assert_eq!(chunks.concat(), s);
            }

            #[test]
            fn split_chunk_count_is_ceiling(s in "[a-z ]{1,300}", max in 1usize..50) {
                let chunks = split_for_length(&s, max);
                let n = s.chars().count();
                prop_assert_eq!(chunks.len(), n.div_ceil(max));
                for chunk in &chunks {
                    prop_assert!(chunk.chars().count() <= max);
                }
            }
        }
    }
}
