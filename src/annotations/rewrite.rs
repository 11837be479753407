//! Path-rewrite group.

use async_trait::async_trait;
use serde::Serialize;

use crate::annotations::error::{AnnotationError, AnnotationResult};
use crate::annotations::parser::{optional, AnnotationField, AnnotationReader, Risk, Shape};
use crate::annotations::{AnnotationParser, Directive, Group};
use crate::resource::RoutingResource;

const TARGET: &str = "rewrite-target";
const ENABLE_REGEX: &str = "rewrite-enable-regex";

const FIELDS: &[AnnotationField] = &[
    AnnotationField::new(TARGET, "rewritten URI, e.g. /$2; needs rewrite-enable-regex", Risk::Captures, Shape::Uri),
    AnnotationField::new(
        ENABLE_REGEX,
        "paths are regular expressions; every path must use ImplementationSpecific",
        Risk::Plain,
        Shape::Word,
    ),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PathRewrite {
    pub target: Option<String>,
    pub regex: bool,
}

pub struct RewriteParser;

#[async_trait]
impl AnnotationParser for RewriteParser {
    fn group(&self) -> Group {
        Group::Rewrite
    }

    fn fields(&self) -> &'static [AnnotationField] {
        FIELDS
    }

    async fn parse(
        &self,
        _resource: &RoutingResource,
        reader: &AnnotationReader<'_>,
    ) -> AnnotationResult<Directive> {
        if !reader.contains(TARGET) && !reader.contains(ENABLE_REGEX) {
            return Err(AnnotationError::Missing(reader.key(TARGET)));
        }

        let target = optional(reader.string(TARGET))?;
        let regex = optional(reader.boolean(ENABLE_REGEX))?.unwrap_or(false);

        if target.is_some() && !regex {
            return Err(AnnotationError::NotSatisfiable(format!(
                "annotation {} requires {} to be true",
                reader.key(TARGET),
                reader.key(ENABLE_REGEX)
            )));
        }

        Ok(Directive::Rewrite(PathRewrite { target, regex }))
    }
}
