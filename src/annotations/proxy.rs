//! Proxy-pass group: forward a path to a host outside the cluster.

use async_trait::async_trait;
use serde::Serialize;

use crate::annotations::error::{AnnotationError, AnnotationResult};
use crate::annotations::parser::{
    is_bare_ip_host, optional, AnnotationField, AnnotationReader, Risk, Shape,
};
use crate::annotations::{AnnotationParser, Directive, Group};
use crate::resource::RoutingResource;

const PATH: &str = "proxy-path";
const HOST: &str = "proxy-host";
const TARGET: &str = "proxy-target";
const SSL: &str = "proxy-ssl";
const ENABLE_REGEX: &str = "proxy-enable-regex";

const FIELDS: &[AnnotationField] = &[
    AnnotationField::new(
        PATH,
        "matching path, e.g. /api or a regex such as /api(/|$)(.*); required",
        Risk::Pattern,
        Shape::PathPattern,
    ),
    AnnotationField::new(HOST, "host outside the cluster, e.g. example.com or 1.1.1.1; required", Risk::Plain, Shape::Host),
    AnnotationField::new(TARGET, "rewrite target when regex matching is enabled, e.g. /$2; optional", Risk::Captures, Shape::Uri),
    AnnotationField::new(SSL, "proxy over https; not allowed with an IP host; optional", Risk::Plain, Shape::Word),
    AnnotationField::new(ENABLE_REGEX, "treat proxy-path as a regular expression; optional", Risk::Plain, Shape::Word),
];

/// External proxy location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyPass {
    pub path: String,
    pub host: String,
    pub target: Option<String>,
    pub tls: bool,
    pub regex: bool,
}

impl ProxyPass {
    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}

pub struct ProxyParser;

#[async_trait]
impl AnnotationParser for ProxyParser {
    fn group(&self) -> Group {
        Group::Proxy
    }

    fn fields(&self) -> &'static [AnnotationField] {
        FIELDS
    }

    async fn parse(
        &self,
        _resource: &RoutingResource,
        reader: &AnnotationReader<'_>,
    ) -> AnnotationResult<Directive> {
        let (path, host) = match (optional(reader.string(PATH))?, optional(reader.string(HOST))?) {
            (None, None) => return Err(AnnotationError::Missing(reader.key(PATH))),
            (Some(_), None) => return Err(AnnotationError::invalid(reader.key(HOST), "")),
            (None, Some(_)) => return Err(AnnotationError::invalid(reader.key(PATH), "")),
            (Some(path), Some(host)) => (path, host),
        };

        let target = optional(reader.string(TARGET))?;
        let tls = optional(reader.boolean(SSL))?.unwrap_or(false);
        let regex = optional(reader.boolean(ENABLE_REGEX))?.unwrap_or(false);

        if target.is_some() && !regex {
            return Err(AnnotationError::NotSatisfiable(format!(
                "annotation {} requires {} to be true",
                reader.key(TARGET),
                reader.key(ENABLE_REGEX)
            )));
        }
        if tls && is_bare_ip_host(&host) {
            return Err(AnnotationError::NotSatisfiable(format!(
                "annotation {} does not allow an IP host when {} is true",
                reader.key(HOST),
                reader.key(SSL)
            )));
        }

        Ok(Directive::Proxy(ProxyPass {
            path,
            host,
            target,
            tls,
            regex,
        }))
    }
}
