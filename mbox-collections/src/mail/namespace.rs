//! Mailbox name canonicalization and the `*`/`%` wildcard matching used by
//! LIST/LSUB (RFC 3501 §6.3.8).

pub const DELIMITER: char = '/';

/// Trims and slash-normalizes a mailbox name; `INBOX` is case-folded,
/// everything else is preserved verbatim.
pub fn canonicalize(name: &str) -> String {
    let trimmed = name.trim();
    let collapsed = collapse_slashes(trimmed);
    if collapsed.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        collapsed
    }
}

fn collapse_slashes(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_was_slash = false;
    for c in name.trim_matches(DELIMITER).chars() {
        if c == DELIMITER {
            if !prev_was_slash {
                out.push(c);
            }
            prev_was_slash = true;
        } else {
            out.push(c);
            prev_was_slash = false;
        }
    }
    out
}

/// "Hierarchically inferior" means a strict prefix match up to the
/// delimiter: `A/B` is inferior to `A`, but `AB` is not.
pub fn is_inferior(candidate: &str, ancestor: &str) -> bool {
    candidate
        .strip_prefix(ancestor)
        .map(|rest| rest.starts_with(DELIMITER))
        .unwrap_or(false)
}

pub fn parent(name: &str) -> Option<&str> {
    name.rfind(DELIMITER).map(|idx| &name[..idx])
}

/// Every parent prefix of `pathspec`, split on `/`, outermost first, plus
/// the leaf itself. `create(pathspec)` walks this list to create missing
/// ancestors before the leaf.
pub fn path_prefixes(pathspec: &str) -> Vec<String> {
    let trimmed = pathspec.trim_end_matches(DELIMITER);
    let segments: Vec<&str> = trimmed.split(DELIMITER).filter(|s| !s.is_empty()).collect();
    (1..=segments.len())
        .map(|n| segments[..n].join(&DELIMITER.to_string()))
        .collect()
}

/// Translates an IMAP `reference`/`wildcard` pair into a predicate over
/// canonical mailbox names: `*` matches any sequence (including the
/// delimiter), `%` matches any sequence not containing the delimiter.
pub fn matches_wildcard(name: &str, reference: &str, wildcard: &str) -> bool {
    let pattern = format!("{reference}{wildcard}");
    wildcard_match(name.as_bytes(), pattern.as_bytes())
}

fn wildcard_match(name: &[u8], pattern: &[u8]) -> bool {
    match pattern.first() {
        None => name.is_empty(),
        Some(b'*') => {
            (0..=name.len()).any(|i| wildcard_match(&name[i..], &pattern[1..]))
        }
        Some(b'%') => (0..=name.len())
            .take_while(|&i| !name[..i].contains(&(DELIMITER as u8)))
            .any(|i| wildcard_match(&name[i..], &pattern[1..])),
        Some(&c) => name.first() == Some(&c) && wildcard_match(&name[1..], &pattern[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_is_case_folded() {
        assert_eq!(canonicalize("inbox"), "INBOX");
        assert_eq!(canonicalize("  InBoX  "), "INBOX");
    }

    #[test]
    fn other_names_preserve_case() {
        assert_eq!(canonicalize("Work/Archive"), "Work/Archive");
    }

    #[test]
    fn collapses_duplicate_and_leading_slashes() {
        assert_eq!(canonicalize("/A//B/"), "A/B");
    }

    #[test]
    fn inferior_requires_delimiter_boundary() {
        assert!(is_inferior("A/B", "A"));
        assert!(!is_inferior("AB", "A"));
        assert!(!is_inferior("A", "A"));
    }

    #[test]
    fn path_prefixes_lists_every_ancestor() {
        assert_eq!(
            path_prefixes("A/B/C"),
            vec!["A".to_string(), "A/B".to_string(), "A/B/C".to_string()]
        );
    }

    #[test]
    fn star_matches_across_delimiters() {
        assert!(matches_wildcard("A/B/C", "", "A*C"));
        assert!(!matches_wildcard("A/B/D", "", "A*C"));
    }

    #[test]
    fn percent_stops_at_delimiter() {
        assert!(matches_wildcard("A/B", "", "A/%"));
        assert!(!matches_wildcard("A/B/C", "", "A/%"));
    }
}
