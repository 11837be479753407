//! Redirect group.

use async_trait::async_trait;
use serde::Serialize;

use crate::annotations::error::AnnotationResult;
use crate::annotations::parser::{AnnotationField, AnnotationReader, Risk, Shape};
use crate::annotations::{AnnotationParser, Directive, Group};
use crate::resource::RoutingResource;

const REDIRECT: &str = "redirect";

const FIELDS: &[AnnotationField] = &[AnnotationField::new(
    REDIRECT,
    "external location every request is redirected to, e.g. https://example.org",
    Risk::Plain,
    Shape::Uri,
)];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redirect {
    /// Absolute URL, scheme included.
    pub target: String,
}

pub struct RedirectParser;

#[async_trait]
impl AnnotationParser for RedirectParser {
    fn group(&self) -> Group {
        Group::Redirect
    }

    fn fields(&self) -> &'static [AnnotationField] {
        FIELDS
    }

    async fn parse(
        &self,
        _resource: &RoutingResource,
        reader: &AnnotationReader<'_>,
    ) -> AnnotationResult<Directive> {
        let target = reader.string(REDIRECT)?;
        let target = if target.contains("://") {
            target
        } else {
            format!("http://{}", target)
        };
        Ok(Directive::Redirect(Redirect { target }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn parse(value: Option<&str>) -> AnnotationResult<Directive> {
        let mut values = BTreeMap::new();
        if let Some(value) = value {
            values.insert("p.io/redirect".to_string(), value.to_string());
        }
        let reader = AnnotationReader::new("p.io", &values);
        RedirectParser.parse(&RoutingResource::default(), &reader).await
    }

    #[tokio::test]
    async fn test_scheme_is_added() {
        assert_eq!(
            parse(Some("example.org/landing")).await.unwrap(),
            Directive::Redirect(Redirect {
                target: "http://example.org/landing".into()
            })
        );
        assert_eq!(
            parse(Some("https://example.org")).await.unwrap(),
            Directive::Redirect(Redirect {
                target: "https://example.org".into()
            })
        );
    }

    #[tokio::test]
    async fn test_absent_and_empty() {
        assert!(parse(None).await.unwrap_err().is_missing());
        assert!(!parse(Some("")).await.unwrap_err().is_missing());
    }
}
