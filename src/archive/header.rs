//! Header parsing helpers: field lookup, alias records, tab scrubbing.
//!
//! An alias record stands in for an article stored under another group
//! (a cross-post is written once and aliased everywhere else). It has an
//! empty body and a one-line head:
//!
//! ```text
//! Message-ID: comp.lang.rust:1234<abc@example.org>\r\n
//!             └─ group ──────┘└ serial ┘└─ message-id ─┘
//! ```

use std::borrow::Cow;

use crate::config::ALIAS_PREFIX;
use crate::newsgroup::validate_group_name;

/// Value of the first header line named `name` (case-insensitive), with
/// leading whitespace and the line terminator removed.
pub fn header_field<'a>(head: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let name = name.as_bytes();

    for line in head.split(|&b| b == b'\n') {
        if line.len() <= name.len() || line[name.len()] != b':' {
            continue;
        }
        if !line[..name.len()].eq_ignore_ascii_case(name) {
            continue;
        }

        let value = &line[name.len() + 1..];
        let start = value
            .iter()
            .position(|b| !matches!(b, b' ' | b'\t' | b'\x0c'))
            .unwrap_or(value.len());
        let value = &value[start..];
        let end = value.iter().position(|&b| b == b'\r').unwrap_or(value.len());
        return Some(&value[..end]);
    }
    None
}

pub fn encode_alias(group: &str, serial: u32, message_id: &str) -> Vec<u8> {
    let mut head = Vec::with_capacity(ALIAS_PREFIX.len() + group.len() + message_id.len() + 16);
    head.extend_from_slice(ALIAS_PREFIX);
    head.extend_from_slice(format!(" {}:{}{}\r\n", group, serial, message_id).as_bytes());
    head
}

/// A record is an alias only when its body is empty and its whole head is
/// one well-formed alias line. Real articles may have empty bodies too.
pub fn is_alias(head: &[u8], body: &[u8]) -> bool {
    if !body.is_empty() {
        return false;
    }
    let line = head.strip_suffix(b"\r\n").unwrap_or(head);
    !line.contains(&b'\n') && parse_alias(line).is_some()
}

/// Target `(group, serial)` of an alias head, or `None` if it does not
/// parse.
pub fn parse_alias(head: &[u8]) -> Option<(String, u32)> {
    let rest = head.strip_prefix(ALIAS_PREFIX)?;
    let rest = &rest[rest.iter().position(|&b| b != b' ')?..];

    let colon = rest.iter().position(|&b| b == b':')?;
    let group = std::str::from_utf8(&rest[..colon]).ok()?;
    validate_group_name(group).ok()?;

    let rest = &rest[colon + 1..];
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || rest.get(digits) != Some(&b'<') {
        return None;
    }
    let serial = std::str::from_utf8(&rest[..digits]).ok()?.parse().ok()?;

    Some((group.to_string(), serial))
}

/// Overview lines are tab separated, so stored heads carry no tabs.
pub fn scrub_tabs(head: &[u8]) -> Cow<'_, [u8]> {
    if !head.contains(&b'\t') {
        return Cow::Borrowed(head);
    }
    Cow::Owned(
        head.iter()
            .map(|&b| if b == b'\t' { b' ' } else { b })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &[u8] = b"From: someone@example.org\r\n\
        Subject: hello\r\n\
        message-id:   <abc@example.org>\r\n\
        Message-ID: <second@example.org>\r\n";

    #[test]
    fn finds_first_field_case_insensitively() {
        assert_eq!(
            header_field(HEAD, "Message-ID"),
            Some(&b"<abc@example.org>"[..])
        );
        assert_eq!(header_field(HEAD, "subject"), Some(&b"hello"[..]));
        assert_eq!(header_field(HEAD, "References"), None);
        assert_eq!(header_field(HEAD, "Subj"), None);
    }

    #[test]
    fn alias_round_trip() {
        let head = encode_alias("comp.lang.rust", 1234, "<abc@example.org>");

        assert_eq!(
            head,
            b"Message-ID: comp.lang.rust:1234<abc@example.org>\r\n".to_vec()
        );
        assert!(is_alias(&head, b""));
        assert!(is_alias(&head[..head.len() - 2], b""));
        assert!(!is_alias(&head, b"body"));
        assert_eq!(
            parse_alias(&head),
            Some(("comp.lang.rust".to_string(), 1234))
        );
    }

    #[test]
    fn malformed_aliases_do_not_parse() {
        let heads: [&[u8]; 5] = [
            b"Message-ID: <abc@example.org>\r\n",
            b"Message-ID: group:<abc@x>\r\n",
            b"Message-ID: group:12abc@x>\r\n",
            b"Message-ID: :12<abc@x>\r\n",
            b"Subject: group:12<abc@x>\r\n",
        ];
        for head in heads {
            assert_eq!(parse_alias(head), None, "{:?}", String::from_utf8_lossy(head));
        }
    }

    #[test]
    fn empty_body_articles_are_not_aliases() {
        let heads: [&[u8]; 4] = [
            b"Message-ID: <e@x>\r\nSubject: empty body\r\n",
            b"Message-ID: <e@x>\r\n",
            b"Message-ID: comp.a:1<e@x>\r\nSubject: looks like one\r\n",
            b"Subject: x\r\n",
        ];
        for head in heads {
            assert!(!is_alias(head, b""), "{:?}", String::from_utf8_lossy(head));
        }
    }

    #[test]
    fn tabs_become_spaces() {
        assert_eq!(&*scrub_tabs(b"a\tb\t"), b"a b ");
        assert!(matches!(scrub_tabs(b"plain"), Cow::Borrowed(_)));
    }
}
