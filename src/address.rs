//! Tolerant RFC 5322 address extraction.
//!
//! Real mail carries malformed address headers; this parser never fails.
//! It tokenizes the input into phrases, emails, comments and separators,
//! accepts at most one email per separator-delimited group, and falls back
//! to returning the original string when nothing parseable is found.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

pub const UNKNOWN_DOMAIN: &str = "localhost.localdomain";

static DOT_ATOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w!#$%&'*+/=?^`{|}~.-]+@[\w-]+(?:\.[\w-]+)*$").expect("dot-atom regex")
});

static AT_WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*@\s*").expect("at whitespace regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Phrase(String),
    Email(String),
    Comment(String),
    Separator,
}

fn tokenize(input: &str) -> (Vec<Token>, bool) {
    let mut tokens = Vec::new();
    let mut parse_error = false;
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut phrase = String::new();
                let mut terminated = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                phrase.push(escaped);
                            }
                        }
                        '"' => {
                            terminated = true;
                            break;
                        }
                        c => phrase.push(c),
                    }
                }
                if terminated {
                    tokens.push(Token::Phrase(phrase));
                } else {
                    parse_error = true;
                    tokens.push(Token::Comment(phrase));
                }
            }
            '<' => {
                chars.next();
                let mut email = String::new();
                let mut terminator = None;
                for c in chars.by_ref() {
                    if matches!(c, '>' | ',' | ';') {
                        terminator = Some(c);
                        break;
                    }
                    email.push(c);
                }
                tokens.push(Token::Email(email));
                if matches!(terminator, Some(',') | Some(';')) {
                    tokens.push(Token::Separator);
                }
            }
            '(' => {
                chars.next();
                let mut comment = String::new();
                let mut depth = 1usize;
                for c in chars.by_ref() {
                    match c {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    if depth > 0 {
                        comment.push(c);
                    }
                }
                if depth > 0 {
                    parse_error = true;
                }
                tokens.push(Token::Comment(comment));
            }
            ',' | ';' => {
                chars.next();
                tokens.push(Token::Separator);
            }
            _ => {
                let mut phrase = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, ',' | ';' | '<' | '(' | '"') {
                        break;
                    }
                    phrase.push(c);
                    chars.next();
                }
                tokens.push(Token::Phrase(phrase));
            }
        }
    }

    // A bare phrase that looks like addr-spec is promoted to an email, unless
    // an explicit <email> follows it.
    for i in 0..tokens.len() {
        if let Token::Phrase(phrase) = &tokens[i]
            && DOT_ATOM_RE.is_match(phrase)
            && !matches!(tokens.get(i + 1), Some(Token::Email(_)))
        {
            tokens[i] = Token::Email(phrase.clone());
        }
    }

    (tokens, parse_error)
}

fn clean_address(raw: &str) -> Option<String> {
    let mut address = raw.trim().trim_matches(|c| c == '<' || c == '>').trim().to_string();
    address = AT_WHITESPACE_RE.replace_all(&address, "@").into_owned();

    if let Some(prefix) = address.get(..7)
        && prefix.eq_ignore_ascii_case("mailto:")
    {
        address = address[7..].to_string();
    }

    if address.ends_with("@unspecified-domain") {
        return None;
    }

    Some(address)
}

/// Extract every address from a tolerant parse of `input`. When nothing
/// parseable is found the original string is returned as a single-element
/// list and the parse error is logged.
pub fn parse_addresses(input: &str) -> Vec<String> {
    let (tokens, parse_error) = tokenize(input);
    if parse_error {
        debug!("address parse error in {input:?}");
    }

    let mut addresses = Vec::new();
    let mut current: Option<String> = None;

    for token in tokens {
        match token {
            Token::Email(email) => {
                // Only one email per group; a second one flushes the first.
                if let Some(previous) = current.replace(email)
                    && let Some(address) = clean_address(&previous)
                {
                    addresses.push(address);
                }
            }
            Token::Separator => {
                if let Some(email) = current.take()
                    && let Some(address) = clean_address(&email)
                {
                    addresses.push(address);
                }
            }
            Token::Phrase(_) | Token::Comment(_) => {}
        }
    }
    if let Some(email) = current.take()
        && let Some(address) = clean_address(&email)
    {
        addresses.push(address);
    }

    if addresses.is_empty() {
        debug!("no address found in {input:?}, returning input as-is");
        return vec![input.to_string()];
    }

    addresses
}

/// The domain of the first address in `input`, lower-cased; the placeholder
/// domain when there is none.
pub fn get_domain_from(input: &str) -> String {
    let addresses = parse_addresses(input);
    addresses
        .first()
        .and_then(|address| address.rsplit_once('@'))
        .map(|(_, domain)| domain.trim().to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
        .unwrap_or_else(|| UNKNOWN_DOMAIN.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_address() {
        assert_eq!(parse_addresses("alice@example.com"), vec!["alice@example.com"]);
    }

    #[test]
    fn display_name_and_angle_brackets() {
        assert_eq!(
            parse_addresses("Alice Example <alice@example.com>"),
            vec!["alice@example.com"]
        );
        assert_eq!(
            parse_addresses("\"Example, Alice\" <alice@example.com>"),
            vec!["alice@example.com"]
        );
    }

    #[test]
    fn comments_are_ignored() {
        assert_eq!(
            parse_addresses("alice@example.com (work address)"),
            vec!["alice@example.com"]
        );
    }

    #[test]
    fn multiple_addresses() {
        assert_eq!(
            parse_addresses("alice@example.com, Bob <bob@example.net>; carol@example.org"),
            vec!["alice@example.com", "bob@example.net", "carol@example.org"]
        );
    }

    #[test]
    fn second_email_in_group_flushes_first() {
        assert_eq!(
            parse_addresses("<alice@example.com> <bob@example.net>"),
            vec!["alice@example.com", "bob@example.net"]
        );
    }

    #[test]
    fn mailto_prefix_and_whitespace_around_at() {
        assert_eq!(
            parse_addresses("<mailto:alice@example.com>"),
            vec!["alice@example.com"]
        );
        assert_eq!(parse_addresses("<alice @ example.com>"), vec!["alice@example.com"]);
    }

    #[test]
    fn unspecified_domain_is_filtered() {
        // nothing parseable remains, so the original string comes back
        assert_eq!(
            parse_addresses("a@unspecified-domain"),
            vec!["a@unspecified-domain"]
        );
        assert_eq!(
            parse_addresses("a@unspecified-domain, bob@example.net"),
            vec!["bob@example.net"]
        );
    }

    #[test]
    fn empty_input_falls_back_to_input() {
        assert_eq!(parse_addresses(""), vec![""]);
    }

    #[test]
    fn unterminated_quote_becomes_comment_and_falls_back() {
        let input = "\"Alice <alice@example.com>";
        assert_eq!(parse_addresses(input), vec![input]);
    }

    #[test]
    fn unterminated_angle_bracket_still_yields_email() {
        assert_eq!(parse_addresses("<alice@example.com"), vec!["alice@example.com"]);
    }

    #[test]
    fn round_trip_local_part_and_domain() {
        let addresses = parse_addresses("Alice <alice@EXAMPLE.com>");
        let reparsed = parse_addresses(&addresses[0]);
        assert_eq!(addresses, reparsed);
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(get_domain_from("Alice <alice@Example.COM>"), "example.com");
        assert_eq!(get_domain_from("no-address-here"), UNKNOWN_DOMAIN);
        assert_eq!(get_domain_from(""), UNKNOWN_DOMAIN);
    }
}
