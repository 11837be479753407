//! Annotation extraction engine.
//!
//! # Data Flow
//! ```text
//! RoutingResource.metadata.annotations
//!     → Extractor (registry: Group → AnnotationParser)
//!     → validate every group (risky value aborts the pass)
//!     → parse every group (missing → omitted, invalid → abort)
//!     → DirectiveBundle (one typed field per group)
//! ```
//!
//! # Design Decisions
//! - Groups are independent; each owns exactly one field of the bundle
//! - Registry is a `BTreeMap` so log output is stable; results do not
//!   depend on evaluation order
//! - Parsers are `async` because the weight group resolves services

pub mod error;
pub mod parser;
pub mod proxy;
pub mod redirect;
pub mod rewrite;
pub mod source_range;
pub mod weight;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::resource::{RoutingResource, ServiceResolver};

pub use error::{AnnotationError, AnnotationResult};
pub use parser::{AnnotationField, AnnotationReader, Risk, Shape};
pub use proxy::ProxyPass;
pub use redirect::Redirect;
pub use rewrite::PathRewrite;
pub use source_range::SourceRange;
pub use weight::{WeightMember, WeightedBackend};

/// Directive groups known to the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Group {
    Proxy,
    Rewrite,
    Redirect,
    AllowList,
    DenyList,
    Weight,
}

impl Group {
    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Proxy => "proxy",
            Group::Rewrite => "rewrite",
            Group::Redirect => "redirect",
            Group::AllowList => "allow-list",
            Group::DenyList => "deny-list",
            Group::Weight => "weight",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed value for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Proxy(ProxyPass),
    Rewrite(PathRewrite),
    Redirect(Redirect),
    AllowList(SourceRange),
    DenyList(SourceRange),
    Weight(WeightedBackend),
}

/// Typed result of extraction. Absent groups are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectiveBundle {
    pub proxy: Option<ProxyPass>,
    pub rewrite: Option<PathRewrite>,
    pub redirect: Option<Redirect>,
    pub allow_list: Option<SourceRange>,
    pub deny_list: Option<SourceRange>,
    pub weight: Option<WeightedBackend>,
}

impl DirectiveBundle {
    /// Store a directive in the field its group owns.
    pub fn set(&mut self, directive: Directive) {
        match directive {
            Directive::Proxy(value) => self.proxy = Some(value),
            Directive::Rewrite(value) => self.rewrite = Some(value),
            Directive::Redirect(value) => self.redirect = Some(value),
            Directive::AllowList(value) => self.allow_list = Some(value),
            Directive::DenyList(value) => self.deny_list = Some(value),
            Directive::Weight(value) => self.weight = Some(value),
        }
    }

    /// Whether path entries must use implementation-specific matching.
    pub fn requires_regex_paths(&self) -> bool {
        self.rewrite.as_ref().is_some_and(|r| r.regex)
    }
}

/// One independent annotation group.
#[async_trait]
pub trait AnnotationParser: Send + Sync {
    fn group(&self) -> Group;

    /// Annotation keys (without prefix) this group reads.
    fn fields(&self) -> &'static [AnnotationField];

    /// Screen raw values before parsing.
    fn validate(&self, reader: &AnnotationReader<'_>) -> AnnotationResult<()> {
        reader.check_fields(self.group(), self.fields())
    }

    /// Produce the group's directive. `Missing` means the group is absent.
    async fn parse(
        &self,
        resource: &RoutingResource,
        reader: &AnnotationReader<'_>,
    ) -> AnnotationResult<Directive>;
}

/// Registry of group parsers.
pub struct Extractor {
    prefix: String,
    parsers: BTreeMap<Group, Box<dyn AnnotationParser>>,
}

impl Extractor {
    /// Extractor with every built-in group registered.
    pub fn new(
        prefix: impl Into<String>,
        service_domain: impl Into<String>,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Self {
        let mut extractor = Self::empty(prefix);
        extractor.register(Box::new(proxy::ProxyParser));
        extractor.register(Box::new(rewrite::RewriteParser));
        extractor.register(Box::new(redirect::RedirectParser));
        extractor.register(Box::new(source_range::SourceRangeParser::allow()));
        extractor.register(Box::new(source_range::SourceRangeParser::deny()));
        extractor.register(Box::new(weight::WeightParser::new(resolver, service_domain)));
        extractor
    }

    pub fn empty(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            parsers: BTreeMap::new(),
        }
    }

    /// Add or replace the parser for its group.
    pub fn register(&mut self, parser: Box<dyn AnnotationParser>) {
        self.parsers.insert(parser.group(), parser);
    }

    pub fn groups(&self) -> impl Iterator<Item = Group> + '_ {
        self.parsers.keys().copied()
    }

    /// Field documentation for every registered group.
    pub fn fields(&self) -> Vec<(Group, &'static [AnnotationField])> {
        self.parsers
            .values()
            .map(|parser| (parser.group(), parser.fields()))
            .collect()
    }

    /// Turn a resource's annotations into a directive bundle.
    pub async fn extract(&self, resource: &RoutingResource) -> AnnotationResult<DirectiveBundle> {
        let reader = AnnotationReader::new(&self.prefix, resource.annotations());
        let key = resource.key();

        for parser in self.parsers.values() {
            if let Err(err) = parser.validate(&reader) {
                tracing::error!(
                    resource = %key,
                    group = %parser.group(),
                    security = true,
                    error = %err,
                    "Rejected risky annotation"
                );
                return Err(err);
            }
        }

        let mut bundle = DirectiveBundle::default();
        for parser in self.parsers.values() {
            match parser.parse(resource, &reader).await {
                Ok(directive) => bundle.set(directive),
                Err(err) if err.is_missing() => {
                    tracing::debug!(resource = %key, group = %parser.group(), "Group not set");
                }
                Err(err) => {
                    tracing::warn!(
                        resource = %key,
                        group = %parser.group(),
                        error = %err,
                        "Invalid annotation group"
                    );
                    return Err(err);
                }
            }
        }

        Ok(bundle)
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor")
            .field("prefix", &self.prefix)
            .field("groups", &self.parsers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Backend, ManifestStore, PathEntry, ServiceInfo, ServicePort};

    const PREFIX: &str = "ingress.nginx.kubebuilder.io";

    fn store() -> Arc<ManifestStore> {
        let service = |name: &str| ServiceInfo {
            name: name.into(),
            namespace: "ns".into(),
            ports: vec![ServicePort::new(80)],
        };
        Arc::new(
            ManifestStore::new()
                .with_service(service("svca"))
                .with_service(service("svcb")),
        )
    }

    fn resource(annotations: &[(&str, &str)]) -> RoutingResource {
        let mut resource = RoutingResource::default();
        resource.metadata.name = "site".into();
        resource.metadata.namespace = "ns".into();
        resource.spec.default_backend = Some(Backend::new("svca", 80));
        for (key, value) in annotations {
            resource
                .metadata
                .annotations
                .insert(format!("{}/{}", PREFIX, key), value.to_string());
        }
        resource
    }

    #[tokio::test]
    async fn test_no_annotations_yields_empty_bundle() {
        let extractor = Extractor::new(PREFIX, "svc", store());
        let bundle = extractor.extract(&resource(&[])).await.unwrap();
        assert_eq!(bundle, DirectiveBundle::default());
    }

    #[tokio::test]
    async fn test_groups_land_in_their_own_fields() {
        let extractor = Extractor::new(PREFIX, "svc", store());
        let bundle = extractor
            .extract(&resource(&[
                ("redirect", "example.org"),
                ("allow-list", "10.0.0.1, 10.0.0.0/8"),
                ("deny-list", "192.168.1.1"),
            ]))
            .await
            .unwrap();

        assert_eq!(bundle.redirect.unwrap().target, "http://example.org");
        assert_eq!(bundle.allow_list.unwrap().len(), 2);
        assert_eq!(bundle.deny_list.unwrap().len(), 1);
        assert!(bundle.proxy.is_none());
        assert!(bundle.weight.is_none());
    }

    #[tokio::test]
    async fn test_invalid_allow_list_aborts() {
        let extractor = Extractor::new(PREFIX, "svc", store());
        let err = extractor
            .extract(&resource(&[("allow-list", "10.0.0.1, bad-value")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotationError::InvalidContent { ref annotation, .. }
            if annotation.ends_with("/allow-list")));
    }

    #[tokio::test]
    async fn test_risky_value_aborts_before_parsing() {
        let extractor = Extractor::new(PREFIX, "svc", store());
        let err = extractor
            .extract(&resource(&[
                ("redirect", "example.org; return 200"),
                ("allow-list", "10.0.0.1"),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotationError::Risky { group: Group::Redirect, .. }));
    }

    #[tokio::test]
    async fn test_foreign_prefix_is_ignored() {
        let extractor = Extractor::new(PREFIX, "svc", store());
        let mut resource = resource(&[]);
        resource
            .metadata
            .annotations
            .insert("other.io/redirect".into(), "evil;".into());
        assert_eq!(
            extractor.extract(&resource).await.unwrap(),
            DirectiveBundle::default()
        );
    }

    #[tokio::test]
    async fn test_extract_is_idempotent() {
        let extractor = Extractor::new(PREFIX, "svc", store());
        let mut resource = resource(&[
            ("use-weight", "true"),
            ("set-weight", "svca:weight=80,svcb:weight=20"),
            ("deny-list", "10.0.0.2,10.0.0.1,10.0.0.2"),
            ("rewrite-enable-regex", "true"),
            ("rewrite-target", "/$1"),
        ]);
        resource.spec.default_backend = None;
        resource.spec.rules.push(crate::resource::HostRule {
            host: "example.com".into(),
            http: crate::resource::HttpRule {
                paths: vec![PathEntry::new("/", "svca", 80)],
            },
        });

        let first = extractor.extract(&resource).await.unwrap();
        let second = extractor.extract(&resource).await.unwrap();
        assert_eq!(first, second);
        assert!(first.requires_regex_paths());
    }

    #[test]
    fn test_registry_lists_every_group() {
        let extractor = Extractor::new(PREFIX, "svc", store());
        let groups: Vec<_> = extractor.groups().map(|g| g.to_string()).collect();
        assert_eq!(
            groups,
            vec!["proxy", "rewrite", "redirect", "allow-list", "deny-list", "weight"]
        );
        assert!(extractor
            .fields()
            .iter()
            .all(|(_, fields)| fields.iter().all(|f| !f.doc.is_empty())));
    }
}
