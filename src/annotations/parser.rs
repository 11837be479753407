//! Shared annotation parsing helpers.
//!
//! # Responsibilities
//! - Map short annotation names to prefixed keys
//! - Typed accessors (string, bool) with missing/invalid distinction
//! - Field registry per group and the risk checks run by `validate`
//! - IPv4 / CIDR literal checks
//!
//! # Design Decisions
//! - Present-but-empty is invalid, absent is missing
//! - Risk checks look for proxy-configuration metacharacters and characters
//!   outside the field's [`Shape`]; whether a value *parses* is the group
//!   parser's concern

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use ipnet::Ipv4Net;
use regex::Regex;

use crate::annotations::error::{AnnotationError, AnnotationResult};
use crate::annotations::Group;

/// Characters that could terminate or open a proxy directive.
const RISKY_CHARS: &[char] = &[';', '{', '}', '\n', '\r', '#', '`', '"', '\'', '\\'];

/// Directive fragments that must never appear in a value.
const RISKY_WORDS: &[&str] = &["load_module", "_by_lua", "lua_package", "serviceaccount"];

/// `$` is only accepted as a numbered regex capture.
static VARIABLE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([^0-9]|$)").expect("variable regex is valid"));

/// How strictly a field's value is screened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Risk {
    /// No variables, no metacharacters.
    Plain,
    /// Like `Plain`, but numbered captures (`$1`) are allowed.
    Captures,
    /// Path match expressions; `$` anchors are allowed.
    Pattern,
}

/// Characters a field's value may consist of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Alphanumerics, for flags.
    Word,
    /// Host name or address, optional port.
    Host,
    /// URI or URI template.
    Uri,
    /// Path literal or path regular expression.
    PathPattern,
    /// Comma separated address list.
    AddressList,
    /// Comma separated `name:key=value` members.
    MemberList,
}

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]+$").expect("word regex is valid"));
static HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.\-:\[\]]+$").expect("host regex is valid"));
static URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9\-._~:/?\[\]@!&()*+,=%$]+$").expect("uri regex is valid")
});
static PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9\-._~:/?\[\]@!&()*+,=%$|^]+$").expect("path regex is valid")
});
static ADDRESS_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.:/,\- ]+$").expect("address list regex is valid"));
static MEMBER_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.\-_:=, ]+$").expect("member list regex is valid"));

impl Shape {
    pub fn matches(self, value: &str) -> bool {
        let pattern = match self {
            Shape::Word => &WORD,
            Shape::Host => &HOST,
            Shape::Uri => &URI,
            Shape::PathPattern => &PATH_PATTERN,
            Shape::AddressList => &ADDRESS_LIST,
            Shape::MemberList => &MEMBER_LIST,
        };
        pattern.is_match(value.trim())
    }
}

/// A recognised annotation of a group.
#[derive(Debug, Clone, Copy)]
pub struct AnnotationField {
    /// Key without prefix.
    pub name: &'static str,
    pub doc: &'static str,
    pub risk: Risk,
    pub shape: Shape,
}

impl AnnotationField {
    pub const fn new(name: &'static str, doc: &'static str, risk: Risk, shape: Shape) -> Self {
        Self {
            name,
            doc,
            risk,
            shape,
        }
    }
}

/// Prefix-aware view over a resource's raw annotations.
#[derive(Debug, Clone, Copy)]
pub struct AnnotationReader<'a> {
    prefix: &'a str,
    values: &'a BTreeMap<String, String>,
}

impl<'a> AnnotationReader<'a> {
    pub fn new(prefix: &'a str, values: &'a BTreeMap<String, String>) -> Self {
        Self { prefix, values }
    }

    /// Fully qualified key for a short name.
    pub fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> Option<&'a str> {
        self.values.get(&self.key(name)).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.raw(name).is_some()
    }

    /// Non-empty string value.
    pub fn string(&self, name: &str) -> AnnotationResult<String> {
        match self.raw(name) {
            None => Err(AnnotationError::Missing(self.key(name))),
            Some(value) if value.trim().is_empty() => {
                Err(AnnotationError::invalid(self.key(name), value))
            }
            Some(value) => Ok(value.trim().to_string()),
        }
    }

    /// Boolean value (`true`/`false`/`1`/`0`/`t`/`f`, any case).
    pub fn boolean(&self, name: &str) -> AnnotationResult<bool> {
        let value = self
            .raw(name)
            .ok_or_else(|| AnnotationError::Missing(self.key(name)))?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(AnnotationError::invalid(self.key(name), value)),
        }
    }

    /// Run the risk checks for every present field of a group.
    pub fn check_fields(&self, group: Group, fields: &[AnnotationField]) -> AnnotationResult<()> {
        for field in fields {
            let Some(value) = self.raw(field.name) else {
                continue;
            };
            if is_risky(value, field.risk) || !field.shape.matches(value) {
                return Err(AnnotationError::Risky {
                    group,
                    annotation: self.key(field.name),
                });
            }
        }
        Ok(())
    }
}

/// Treat a missing value as `None`, surface everything else.
pub fn optional<T>(result: AnnotationResult<T>) -> AnnotationResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_missing() => Ok(None),
        Err(err) => Err(err),
    }
}

fn is_risky(value: &str, risk: Risk) -> bool {
    if value.contains(RISKY_CHARS) {
        return true;
    }
    let lower = value.to_ascii_lowercase();
    if RISKY_WORDS.iter().any(|word| lower.contains(word)) {
        return true;
    }
    match risk {
        Risk::Plain => value.contains('$'),
        Risk::Captures => VARIABLE_REFERENCE.is_match(value),
        Risk::Pattern => false,
    }
}

/// Literal dotted-quad IPv4 address, optionally with a CIDR suffix.
pub fn is_ipv4_or_cidr(value: &str) -> bool {
    if value.contains('/') {
        value.parse::<Ipv4Net>().is_ok()
    } else {
        value.parse::<Ipv4Addr>().is_ok()
    }
}

/// Host part of `host[:port]` is a bare IPv4 address.
pub fn is_bare_ip_host(host: &str) -> bool {
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    host.parse::<Ipv4Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("p.io/{}", k), v.to_string()))
            .collect()
    }

    #[test]
    fn test_string_missing_vs_empty() {
        let values = annotations(&[("empty", "  ")]);
        let reader = AnnotationReader::new("p.io", &values);

        assert!(reader.string("absent").unwrap_err().is_missing());
        assert!(matches!(
            reader.string("empty").unwrap_err(),
            AnnotationError::InvalidContent { .. }
        ));
        assert_eq!(optional(reader.string("absent")).unwrap(), None);
    }

    #[test]
    fn test_boolean_parsing() {
        let values = annotations(&[("a", "True"), ("b", "0"), ("c", "yes")]);
        let reader = AnnotationReader::new("p.io", &values);

        assert_eq!(reader.boolean("a"), Ok(true));
        assert_eq!(reader.boolean("b"), Ok(false));
        assert!(matches!(
            reader.boolean("c"),
            Err(AnnotationError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_risk_checks() {
        assert!(is_risky("example.com; root /", Risk::Plain));
        assert!(is_risky("a}b", Risk::Plain));
        assert!(is_risky("$host", Risk::Captures));
        assert!(is_risky("/x/$", Risk::Captures));
        assert!(is_risky("content_by_lua_block", Risk::Plain));
        assert!(!is_risky("/$1/$2", Risk::Captures));
        assert!(is_risky("/$1", Risk::Plain));
        assert!(!is_risky("10.0.0.1, bad-value", Risk::Plain));
        assert!(!is_risky("/api(/|$)(.*)", Risk::Pattern));
        assert!(is_risky("/api;", Risk::Pattern));
    }

    #[test]
    fn test_check_fields_only_looks_at_present_fields() {
        const FIELDS: &[AnnotationField] = &[
            AnnotationField::new("host", "upstream host", Risk::Plain, Shape::Host),
            AnnotationField::new("target", "rewrite target", Risk::Captures, Shape::Uri),
        ];
        let values = annotations(&[("target", "/$1"), ("other", "a;b")]);
        let reader = AnnotationReader::new("p.io", &values);
        assert!(reader.check_fields(Group::Proxy, FIELDS).is_ok());

        let values = annotations(&[("host", "evil.com;")]);
        let reader = AnnotationReader::new("p.io", &values);
        assert_eq!(
            reader.check_fields(Group::Proxy, FIELDS),
            Err(AnnotationError::Risky {
                group: Group::Proxy,
                annotation: "p.io/host".into()
            })
        );
    }

    #[test]
    fn test_value_outside_shape_is_risky() {
        const FIELDS: &[AnnotationField] = &[
            AnnotationField::new("ssl", "proxy over https", Risk::Plain, Shape::Word),
            AnnotationField::new("host", "upstream host", Risk::Plain, Shape::Host),
        ];
        let values = annotations(&[("ssl", "true"), ("host", "example.com:8443")]);
        let reader = AnnotationReader::new("p.io", &values);
        assert!(reader.check_fields(Group::Proxy, FIELDS).is_ok());

        let values = annotations(&[("host", "example.com/admin")]);
        let reader = AnnotationReader::new("p.io", &values);
        assert!(matches!(
            reader.check_fields(Group::Proxy, FIELDS),
            Err(AnnotationError::Risky { .. })
        ));

        let values = annotations(&[("ssl", "tr ue")]);
        let reader = AnnotationReader::new("p.io", &values);
        assert!(reader.check_fields(Group::Proxy, FIELDS).is_err());
    }

    #[test]
    fn test_shapes() {
        assert!(Shape::Uri.matches("https://example.org/a?b=1"));
        assert!(!Shape::Uri.matches("https://example.org/<script>"));
        assert!(Shape::PathPattern.matches("/api(/|$)(.*)"));
        assert!(!Shape::PathPattern.matches("/api <x>"));
        assert!(Shape::AddressList.matches("10.0.0.1, bad-value"));
        assert!(!Shape::AddressList.matches("10.0.0.1 && rm"));
        assert!(Shape::MemberList.matches("svca:weight=80, svcb:weight=20"));
        assert!(!Shape::MemberList.matches("svca:weight=80|svcb"));
    }

    #[test]
    fn test_ip_checks() {
        assert!(is_ipv4_or_cidr("10.0.0.1"));
        assert!(is_ipv4_or_cidr("10.0.0.0/8"));
        assert!(!is_ipv4_or_cidr("10.0.0.0/33"));
        assert!(!is_ipv4_or_cidr("300.0.0.1"));
        assert!(!is_ipv4_or_cidr("bad-value"));
        assert!(!is_ipv4_or_cidr("::1"));

        assert!(is_bare_ip_host("1.1.1.1"));
        assert!(is_bare_ip_host("1.1.1.1:8443"));
        assert!(!is_bare_ip_host("example.com"));
    }
}
