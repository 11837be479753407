//! Weighted-backend group: split traffic across services by weight.
//!
//! # Responsibilities
//! - Parse `svc:weight=N` members
//! - Check that every path under one host rule is identical
//! - Resolve each member to `<svc>.<ns>.<domain>:<port>` and derive the
//!   upstream name `<svcA>-<svcB>-<resource>-<namespace>`
//!
//! # Design Decisions
//! - At least two members are required; a single member is not a split
//! - Every member must resolve; an upstream with a dead member is rejected
//! - `weight=0` marks the member `down` instead of removing it

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::annotations::error::{AnnotationError, AnnotationResult};
use crate::annotations::parser::{AnnotationField, AnnotationReader, Risk, Shape};
use crate::annotations::{AnnotationParser, Directive, Group};
use crate::resource::{RoutingResource, ServiceResolver};

const USE_WEIGHT: &str = "use-weight";
const SET_WEIGHT: &str = "set-weight";

const FIELDS: &[AnnotationField] = &[
    AnnotationField::new(USE_WEIGHT, "enable weighted traffic splitting, true or false", Risk::Plain, Shape::Word),
    AnnotationField::new(
        SET_WEIGHT,
        "weighted members, e.g. svc-a:weight=80,svc-b:weight=20",
        Risk::Plain,
        Shape::MemberList,
    ),
];

/// One member of the split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeightMember {
    pub service: String,
    pub weight: u32,
}

impl WeightMember {
    /// Parse `svc:weight=N`.
    pub fn parse(value: &str) -> Option<Self> {
        let (service, weight) = value.split_once(':')?;
        let weight = weight.trim().strip_prefix("weight=")?.parse().ok()?;
        let service = service.trim();
        if service.is_empty() {
            return None;
        }
        Some(Self {
            service: service.to_string(),
            weight,
        })
    }

    /// Server parameter rendered after the address.
    pub fn directive(&self) -> String {
        if self.weight == 0 {
            "down".to_string()
        } else {
            format!("weight={}", self.weight)
        }
    }
}

/// A resolved weighted upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeightedBackend {
    pub upstream: String,
    /// `host:port weight=N` lines in member order.
    pub lines: Vec<String>,
    pub members: Vec<WeightMember>,
    /// Raw `set-weight` value.
    pub spec: String,
}

/// Every path under each host rule must be identical.
pub fn check_path_consistency(resource: &RoutingResource) -> AnnotationResult<()> {
    for rule in &resource.spec.rules {
        let mut paths = rule.http.paths.iter().map(|entry| entry.path.as_str());
        if let Some(first) = paths.next() {
            if let Some(other) = paths.find(|path| *path != first) {
                return Err(AnnotationError::NotSatisfiable(format!(
                    "weighted backends need identical paths under host {:?} of {}, found {:?} and {:?}",
                    rule.host,
                    resource.key(),
                    first,
                    other
                )));
            }
        }
    }
    Ok(())
}

pub struct WeightParser {
    resolver: Arc<dyn ServiceResolver>,
    service_domain: String,
}

impl WeightParser {
    pub fn new(resolver: Arc<dyn ServiceResolver>, service_domain: impl Into<String>) -> Self {
        Self {
            resolver,
            service_domain: service_domain.into(),
        }
    }
}

#[async_trait]
impl AnnotationParser for WeightParser {
    fn group(&self) -> Group {
        Group::Weight
    }

    fn fields(&self) -> &'static [AnnotationField] {
        FIELDS
    }

    async fn parse(
        &self,
        resource: &RoutingResource,
        reader: &AnnotationReader<'_>,
    ) -> AnnotationResult<Directive> {
        if !reader.boolean(USE_WEIGHT)? {
            return Err(AnnotationError::Missing(reader.key(USE_WEIGHT)));
        }

        let spec = match reader.string(SET_WEIGHT) {
            Err(err) if err.is_missing() => {
                return Err(AnnotationError::NotSatisfiable(format!(
                    "annotation {} is true but {} is not set",
                    reader.key(USE_WEIGHT),
                    reader.key(SET_WEIGHT)
                )))
            }
            other => other?,
        };

        check_path_consistency(resource)?;

        let members = spec
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|member| {
                WeightMember::parse(member)
                    .ok_or_else(|| AnnotationError::invalid(reader.key(SET_WEIGHT), spec.clone()))
            })
            .collect::<AnnotationResult<Vec<_>>>()?;

        if members.len() < 2 {
            return Err(AnnotationError::NotSatisfiable(format!(
                "at least two services are required for weighted backends, {} has {}",
                resource.key(),
                members.len()
            )));
        }

        let namespace = resource.namespace();
        let mut names = Vec::with_capacity(members.len());
        let mut lines = Vec::with_capacity(members.len());
        for member in &members {
            let unresolved = || AnnotationError::UnresolvedBackend {
                namespace: namespace.to_string(),
                service: member.service.clone(),
            };
            let service = self
                .resolver
                .get_service(namespace, &member.service)
                .await
                .map_err(|_| unresolved())?;
            let port = service.first_port().ok_or_else(unresolved)?;

            lines.push(format!(
                "{}.{}.{}:{} {}",
                service.name,
                service.namespace,
                self.service_domain,
                port,
                member.directive()
            ));
            names.push(service.name);
        }

        let upstream = format!(
            "{}-{}-{}",
            names.join("-"),
            resource.name(),
            resource.namespace()
        );

        Ok(Directive::Weight(WeightedBackend {
            upstream,
            lines,
            members,
            spec,
        }))
    }
}
