//! Ordered `Authentication-Results` fragments, pre/append header queues, the
//! handler-aware sorter and the serializer.
//!
//! Two fragment representations coexist: opaque strings (legacy, deprecated)
//! and structured entries. A single legacy fragment forces the legacy
//! serialization of the whole header.

use std::cmp::Ordering;

use crate::config::HeaderFormat;

/// One handler's contribution to the `Authentication-Results` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFragment {
    Legacy(String),
    Entry(AuthEntry),
}

impl AuthFragment {
    /// The handler key, e.g. `spf` for `spf=pass`. Legacy fragments derive it
    /// from the text before the first `=`.
    pub fn key(&self) -> &str {
        match self {
            AuthFragment::Legacy(text) => text.split('=').next().unwrap_or(text).trim(),
            AuthFragment::Entry(entry) => &entry.method,
        }
    }

    /// The identifying property value, used for duplicate suppression.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            AuthFragment::Legacy(_) => None,
            AuthFragment::Entry(entry) => entry.props.first().map(|(_, value)| value.as_str()),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            AuthFragment::Legacy(text) => text.clone(),
            AuthFragment::Entry(entry) => entry.as_string(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, AuthFragment::Legacy(_))
    }
}

/// Structured `method=result ptype.prop=value (comment)` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEntry {
    method: String,
    result: String,
    props: Vec<(String, String)>,
    comment: Option<String>,
}

impl AuthEntry {
    pub fn new(method: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            result: result.into(),
            props: Vec::new(),
            comment: None,
        }
    }

    pub fn prop(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.push((name.into(), value.into()));
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.method
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn as_string(&self) -> String {
        let mut out = format!("{}={}", self.method, self.result);
        for (name, value) in &self.props {
            out.push(' ');
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        if let Some(comment) = &self.comment {
            out.push_str(" (");
            out.push_str(comment);
            out.push(')');
        }
        out
    }
}

impl From<AuthEntry> for AuthFragment {
    fn from(entry: AuthEntry) -> Self {
        AuthFragment::Entry(entry)
    }
}

/// A queued header mutation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Decides ordering between two fragments that share a handler key.
/// Implemented by the handler registry.
pub trait FragmentSorter {
    fn sort_same_key(&self, key: &str, a: &AuthFragment, b: &AuthFragment) -> Option<Ordering>;
}

/// A sorter with no handler-specific ordering; everything falls back to the
/// lexical comparison.
pub struct LexicalSorter;

impl FragmentSorter for LexicalSorter {
    fn sort_same_key(&self, _key: &str, _a: &AuthFragment, _b: &AuthFragment) -> Option<Ordering> {
        None
    }
}

#[derive(Default)]
pub struct HeaderAccumulator {
    /// Connection-scope fragments, re-emitted on every message.
    c_auth_headers: Vec<AuthFragment>,
    /// Message-scope fragments.
    auth_headers: Vec<AuthFragment>,
    /// Headers inserted at index 1, after `Authentication-Results`.
    pre_headers: Vec<Header>,
    /// Headers appended after the existing ones.
    add_headers: Vec<Header>,
}

impl HeaderAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_c_auth_header(&mut self, fragment: impl Into<AuthFragment>) {
        self.c_auth_headers.push(fragment.into());
    }

    pub fn add_auth_header(&mut self, fragment: impl Into<AuthFragment>) {
        self.auth_headers.push(fragment.into());
    }

    pub fn prepend_header(&mut self, header: Header) {
        self.pre_headers.push(header);
    }

    pub fn append_header(&mut self, header: Header) {
        self.add_headers.push(header);
    }

    pub fn pre_headers(&self) -> &[Header] {
        &self.pre_headers
    }

    pub fn pre_headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.pre_headers
    }

    pub fn add_headers(&self) -> &[Header] {
        &self.add_headers
    }

    pub fn add_headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.add_headers
    }

    /// All fragments for the current message, connection scope first, sorted
    /// and deduplicated.
    pub fn sorted_fragments(&self, sorter: &dyn FragmentSorter) -> Vec<AuthFragment> {
        let mut fragments: Vec<AuthFragment> = self
            .c_auth_headers
            .iter()
            .chain(self.auth_headers.iter())
            .cloned()
            .collect();

        fragments.sort_by(|a, b| {
            if a.key().eq_ignore_ascii_case(b.key())
                && let Some(ordering) = sorter.sort_same_key(&a.key().to_ascii_lowercase(), a, b)
            {
                return ordering;
            }
            a.as_string().cmp(&b.as_string())
        });

        // Only the first fragment with a given (key, identifier) survives.
        let mut seen: Vec<(String, String)> = Vec::new();
        fragments.retain(|fragment| {
            let Some(identifier) = fragment.identifier() else {
                return true;
            };
            let id = (fragment.key().to_ascii_lowercase(), identifier.to_string());
            if seen.contains(&id) {
                false
            } else {
                seen.push(id);
                true
            }
        });

        fragments
    }

    /// Serialize the `Authentication-Results` value. The first folded line is
    /// the authserv-id; each fragment goes on its own line indented by the
    /// configured amount; `none` when no handler contributed.
    pub fn serialize_auth_results(
        &self,
        hostname: &str,
        format: &HeaderFormat,
        sorter: &dyn FragmentSorter,
    ) -> String {
        let fragments = self.sorted_fragments(sorter);

        if fragments.is_empty() {
            return format!("{hostname};\n{}none", " ".repeat(format.indent_by));
        }

        let rendered: Vec<String> = fragments.iter().map(AuthFragment::as_string).collect();

        if format.indent_style == "flat" && !fragments.iter().any(AuthFragment::is_legacy) {
            let flat = format!("{hostname}; {}", rendered.join("; "));
            if flat.len() <= format.fold_at {
                return flat;
            }
        }

        let indent = " ".repeat(format.indent_by);
        format!("{hostname};\n{indent}{}", rendered.join(&format!(";\n{indent}")))
    }

    /// Drop message-scope state; connection-scope fragments survive.
    pub fn clear_message(&mut self) {
        self.auth_headers.clear();
        self.pre_headers.clear();
        self.add_headers.clear();
    }

    pub fn clear(&mut self) {
        self.c_auth_headers.clear();
        self.clear_message();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn format() -> HeaderFormat {
        HeaderFormat::default()
    }

    #[test]
    fn empty_accumulator_serializes_none() {
        let accumulator = HeaderAccumulator::new();
        assert_eq!(
            accumulator.serialize_auth_results("mx.example.com", &format(), &LexicalSorter),
            "mx.example.com;\n    none"
        );
    }

    #[test]
    fn fragments_fold_one_per_line() {
        let mut accumulator = HeaderAccumulator::new();
        accumulator.add_c_auth_header(
            AuthEntry::new("iprev", "pass")
                .prop("policy.iprev", "192.0.2.10")
                .comment("mail.example.com"),
        );
        accumulator
            .add_auth_header(AuthEntry::new("spf", "pass").prop("smtp.mailfrom", "alice@example.com"));

        let value = accumulator.serialize_auth_results("mx.example.com", &format(), &LexicalSorter);
        assert_eq!(
            value,
            "mx.example.com;\n    iprev=pass policy.iprev=192.0.2.10 (mail.example.com);\n    spf=pass smtp.mailfrom=alice@example.com"
        );
    }

    #[test]
    fn legacy_fragment_forces_string_serialization() {
        let mut accumulator = HeaderAccumulator::new();
        accumulator.add_auth_header(AuthFragment::Legacy("x-old=pass".to_string()));
        accumulator.add_auth_header(AuthEntry::new("spf", "pass"));

        let value = accumulator.serialize_auth_results("mx.example.com", &format(), &LexicalSorter);
        assert_eq!(value, "mx.example.com;\n    spf=pass;\n    x-old=pass");
    }

    #[test]
    fn duplicate_key_identifier_pairs_are_dropped() {
        let mut accumulator = HeaderAccumulator::new();
        accumulator.add_auth_header(
            AuthEntry::new("dkim", "pass").prop("header.d", "example.com"),
        );
        accumulator.add_auth_header(
            AuthEntry::new("dkim", "pass").prop("header.d", "example.com"),
        );
        accumulator.add_auth_header(
            AuthEntry::new("dkim", "fail").prop("header.d", "example.net"),
        );

        let fragments = accumulator.sorted_fragments(&LexicalSorter);
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn sort_is_stable_and_lexical_by_default() {
        let mut accumulator = HeaderAccumulator::new();
        accumulator.add_auth_header(AuthEntry::new("spf", "pass"));
        accumulator.add_auth_header(AuthEntry::new("dkim", "pass").prop("header.d", "a.example"));
        accumulator.add_auth_header(AuthEntry::new("dkim", "pass").prop("header.d", "b.example"));

        let fragments = accumulator.sorted_fragments(&LexicalSorter);
        let rendered: Vec<String> = fragments.iter().map(AuthFragment::as_string).collect();
        assert_eq!(
            rendered,
            vec![
                "dkim=pass header.d=a.example",
                "dkim=pass header.d=b.example",
                "spf=pass",
            ]
        );
    }

    #[test]
    fn connection_fragments_survive_message_clear() {
        let mut accumulator = HeaderAccumulator::new();
        accumulator.add_c_auth_header(AuthEntry::new("x-local-ip", "pass"));
        accumulator.add_auth_header(AuthEntry::new("spf", "pass"));
        accumulator.append_header(Header::new("X-Test", "x"));

        accumulator.clear_message();
        let fragments = accumulator.sorted_fragments(&LexicalSorter);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].key(), "x-local-ip");
        assert!(accumulator.add_headers().is_empty());
    }
}
