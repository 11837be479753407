//! Source-IP allow and deny lists.
//!
//! Both groups share one parser type; they differ only in the annotation key
//! they read and the bundle field they fill.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;

use crate::annotations::error::{AnnotationError, AnnotationResult};
use crate::annotations::parser::{
    is_ipv4_or_cidr, AnnotationField, AnnotationReader, Risk, Shape,
};
use crate::annotations::{AnnotationParser, Directive, Group};
use crate::resource::RoutingResource;

const ALLOW: &str = "allow-list";
const DENY: &str = "deny-list";

const ALLOW_FIELDS: &[AnnotationField] = &[AnnotationField::new(
    ALLOW,
    "comma separated IPv4 addresses or CIDRs allowed to reach the server",
    Risk::Plain,
    Shape::AddressList,
)];

const DENY_FIELDS: &[AnnotationField] = &[AnnotationField::new(
    DENY,
    "comma separated IPv4 addresses or CIDRs refused by the server",
    Risk::Plain,
    Shape::AddressList,
)];

/// Deduplicated set of IPv4 addresses / CIDRs. Iterates in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SourceRange(BTreeSet<String>);

impl SourceRange {
    /// Parse a comma separated list; any invalid member rejects the whole list.
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut members = BTreeSet::new();
        for member in value.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            if !is_ipv4_or_cidr(member) {
                return Err(member.to_string());
            }
            members.insert(member.to_string());
        }
        if members.is_empty() {
            return Err(value.to_string());
        }
        Ok(Self(members))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.0.contains(member)
    }
}

pub struct SourceRangeParser {
    group: Group,
    key: &'static str,
    fields: &'static [AnnotationField],
}

impl SourceRangeParser {
    pub fn allow() -> Self {
        Self {
            group: Group::AllowList,
            key: ALLOW,
            fields: ALLOW_FIELDS,
        }
    }

    pub fn deny() -> Self {
        Self {
            group: Group::DenyList,
            key: DENY,
            fields: DENY_FIELDS,
        }
    }
}

#[async_trait]
impl AnnotationParser for SourceRangeParser {
    fn group(&self) -> Group {
        self.group
    }

    fn fields(&self) -> &'static [AnnotationField] {
        self.fields
    }

    async fn parse(
        &self,
        _resource: &RoutingResource,
        reader: &AnnotationReader<'_>,
    ) -> AnnotationResult<Directive> {
        let value = reader.string(self.key)?;
        let range = SourceRange::parse(&value).map_err(|member| {
            tracing::debug!(annotation = %reader.key(self.key), member = %member, "Invalid source range member");
            AnnotationError::invalid(reader.key(self.key), value.clone())
        })?;

        Ok(match self.group {
            Group::DenyList => Directive::DenyList(range),
            _ => Directive::AllowList(range),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_trims_and_dedups() {
        let range = SourceRange::parse(" 10.0.0.2,10.0.0.1 , 10.0.0.2, 172.16.0.0/12,").unwrap();
        assert_eq!(
            range.iter().collect::<Vec<_>>(),
            vec!["10.0.0.1", "10.0.0.2", "172.16.0.0/12"]
        );
    }

    #[test]
    fn test_parse_rejects_bad_member() {
        assert_eq!(
            SourceRange::parse("10.0.0.1, bad-value"),
            Err("bad-value".to_string())
        );
        assert!(SourceRange::parse(" , ").is_err());
    }

    #[test]
    fn test_order_insensitive() {
        assert_eq!(
            SourceRange::parse("10.0.0.1,10.0.0.2").unwrap(),
            SourceRange::parse("10.0.0.2,10.0.0.1").unwrap()
        );
    }

    #[tokio::test]
    async fn test_deny_parser_fills_deny_group() {
        let values: BTreeMap<String, String> =
            [("p.io/deny-list".to_string(), "10.1.1.1".to_string())].into();
        let reader = AnnotationReader::new("p.io", &values);

        let directive = SourceRangeParser::deny()
            .parse(&RoutingResource::default(), &reader)
            .await
            .unwrap();
        assert!(matches!(directive, Directive::DenyList(ref r) if r.contains("10.1.1.1")));

        let allow = SourceRangeParser::allow()
            .parse(&RoutingResource::default(), &reader)
            .await
            .unwrap_err();
        assert!(allow.is_missing());
    }
}
