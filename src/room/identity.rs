//! Room identity parsing.
//!
//! This is a security boundary: anything that smells like traversal or
//! carries control characters is rejected before any matching happens.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

use super::{Channel, RoomIdentity};

fn room_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^doc:([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})(?::([a-z][a-z0-9_-]*))?$",
        )
        .expect("room pattern is valid")
    })
}

fn is_unsafe(segment: &str) -> bool {
    segment.contains("..") || segment.chars().any(|c| c == '\0' || c.is_control())
}

/// Parse a literal room string or a `/party(ies)/<kind>/<room>` path.
///
/// Returns `None` for anything unsafe or malformed.
pub fn parse_room(input: &str) -> Option<RoomIdentity> {
    if is_unsafe(input) {
        return None;
    }

    if input.starts_with('/') {
        return parse_room_path(input);
    }

    match_room(input)
}

/// Parse the room token out of a URL path
pub fn parse_room_path(path: &str) -> Option<RoomIdentity> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if segments.iter().any(|s| is_unsafe(s)) {
        return None;
    }

    match segments.as_slice() {
        ["party" | "parties", kind, room, ..] if !kind.is_empty() => match_room(room),
        _ => None,
    }
}

/// Match the canonical pattern against the raw token, then its once-decoded form
fn match_room(raw: &str) -> Option<RoomIdentity> {
    if let Some(identity) = match_canonical(raw) {
        return Some(identity);
    }

    let decoded = urlencoding::decode(raw).ok()?;
    if is_unsafe(&decoded) {
        return None;
    }
    match_canonical(&decoded)
}

fn match_canonical(candidate: &str) -> Option<RoomIdentity> {
    let caps = room_pattern().captures(candidate)?;
    let document_id = Uuid::parse_str(caps.get(1)?.as_str()).ok()?;
    let channel = match caps.get(2) {
        Some(slug) => Channel::from_slug(slug.as_str())?,
        None => Channel::Sync,
    };

    Some(RoomIdentity {
        document_id,
        channel,
        raw_name: candidate.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DOC: &str = "6f1c2d4e-8a9b-4c3d-9e8f-0a1b2c3d4e5f";

    #[test]
    fn test_literal_room_defaults_to_sync() {
        let identity = parse_room(&format!("doc:{}", DOC)).unwrap();
        assert_eq!(identity.document_id.to_string(), DOC);
        assert_eq!(identity.channel, Channel::Sync);
        assert_eq!(identity.raw_name, format!("doc:{}", DOC));
    }

    #[test]
    fn test_channel_suffixes() {
        let sharing = parse_room(&format!("doc:{}:sharing", DOC)).unwrap();
        assert_eq!(sharing.channel, Channel::Sharing);

        let permissions = parse_room(&format!("doc:{}:permissions", DOC)).unwrap();
        assert_eq!(permissions.channel, Channel::Permissions);

        assert!(parse_room(&format!("doc:{}:presence", DOC)).is_none());
    }

    #[test]
    fn test_both_path_shapes() {
        let a = parse_room(&format!("/party/main/doc:{}", DOC)).unwrap();
        let b = parse_room(&format!("/parties/main/doc:{}:sharing", DOC)).unwrap();
        assert_eq!(a.channel, Channel::Sync);
        assert_eq!(b.channel, Channel::Sharing);
        assert_eq!(a.document_id, b.document_id);
    }

    #[test]
    fn test_admin_suffix_still_resolves_room() {
        let identity =
            parse_room(&format!("/parties/main/doc:{}:permissions/admin/revoke", DOC)).unwrap();
        assert_eq!(identity.channel, Channel::Permissions);
    }

    #[test]
    fn test_percent_encoded_token_decoded_once() {
        let encoded = format!("/parties/main/doc%3A{}%3Asharing", DOC);
        let identity = parse_room(&encoded).unwrap();
        assert_eq!(identity.channel, Channel::Sharing);

        // Double encoding is not unwrapped twice
        let double = format!("/parties/main/doc%253A{}", DOC);
        assert!(parse_room(&double).is_none());
    }

    #[test]
    fn test_rejects_unsafe_input() {
        assert!(parse_room(&format!("/parties/../doc:{}", DOC)).is_none());
        assert!(parse_room(&format!("doc:{}\0", DOC)).is_none());
        assert!(parse_room(&format!("doc:{}\n", DOC)).is_none());
        assert!(parse_room(&format!("/parties/main/doc%3A{}%2E%2E", DOC)).is_none());
        assert!(parse_room(&format!("/parties/main/doc%3A{}%00", DOC)).is_none());
    }

    #[test]
    fn test_rejects_unknown_shapes() {
        assert!(parse_room(&format!("/rooms/main/doc:{}", DOC)).is_none());
        assert!(parse_room(&format!("/parties//doc:{}", DOC)).is_none());
        assert!(parse_room("doc:not-a-uuid").is_none());
        assert!(parse_room("").is_none());
    }

    fn channel_strategy() -> impl Strategy<Value = Channel> {
        prop_oneof![
            Just(Channel::Sync),
            Just(Channel::Sharing),
            Just(Channel::Permissions)
        ]
    }

    proptest! {
        #[test]
        fn prop_valid_rooms_roundtrip(bytes in any::<[u8; 16]>(), channel in channel_strategy(), explicit in any::<bool>()) {
            let id = Uuid::from_bytes(bytes);
            let room = if channel == Channel::Sync && !explicit {
                format!("doc:{}", id)
            } else {
                format!("doc:{}:{}", id, channel)
            };

            let literal = parse_room(&room).unwrap();
            prop_assert_eq!(literal.document_id, id);
            prop_assert_eq!(literal.channel, channel);

            let via_path = parse_room(&format!("/parties/main/{}", room)).unwrap();
            prop_assert_eq!(via_path.document_id, id);
            prop_assert_eq!(via_path.channel, channel);
        }

        #[test]
        fn prop_unsafe_markers_always_rejected(
            prefix in "[a-z:/0-9-]{0,24}",
            suffix in "[a-z:/0-9-]{0,24}",
            marker in prop_oneof![Just(".."), Just("\0"), Just("\u{7}"), Just("\r")],
        ) {
            let candidate = format!("{}{}{}", prefix, marker, suffix);
            prop_assert!(parse_room(&candidate).is_none());
            let with_room = format!("/parties/main/doc:{}{}", DOC, marker);
            prop_assert!(parse_room(&with_room).is_none());
        }
    }
}
