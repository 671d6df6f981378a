//! Route pattern artifacts consumed by hosting adapters.
//!
//! Templates come from the `routes` field of the all-paths response, e.g.
//! `/blog/:slug`, `/docs/*` or `/post-:id`, and are written next to the build
//! output as `route-patterns.json`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route template must start with `/`, got `{template}`")]
    NotAbsolute { template: String },
    #[error("route template `{template}` has an empty parameter name")]
    EmptyParameter { template: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteKind {
    Prerender,
    PrerenderWithFallback,
    Serverless,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Segment {
    Literal { value: String },
    Dynamic,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePattern {
    pub kind: RouteKind,
    pub path_pattern: Vec<Segment>,
}

/// A route entry as declared by the runtime: a bare template or `{kind, route}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RouteDeclaration {
    Template(String),
    Annotated { kind: RouteKind, route: String },
}

impl RoutePattern {
    pub fn parse(kind: RouteKind, template: &str) -> Result<Self, RouteError> {
        if !template.starts_with('/') {
            return Err(RouteError::NotAbsolute {
                template: template.to_string(),
            });
        }

        let path_pattern = template
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| parse_segment(template, segment))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { kind, path_pattern })
    }

    pub fn is_static(&self) -> bool {
        self.path_pattern
            .iter()
            .all(|segment| matches!(segment, Segment::Literal { .. }))
    }
}

impl TryFrom<RouteDeclaration> for RoutePattern {
    type Error = RouteError;

    fn try_from(value: RouteDeclaration) -> Result<Self, Self::Error> {
        match value {
            RouteDeclaration::Template(template) => {
                RoutePattern::parse(RouteKind::Prerender, &template)
            }
            RouteDeclaration::Annotated { kind, route } => RoutePattern::parse(kind, &route),
        }
    }
}

fn parse_segment(template: &str, segment: &str) -> Result<Segment, RouteError> {
    if segment == "*" {
        return Ok(Segment::Dynamic);
    }
    match segment.find(':') {
        None => Ok(Segment::Literal {
            value: segment.to_string(),
        }),
        Some(index) => {
            let name = segment[index + 1..].trim_end_matches('?');
            if name.is_empty() {
                return Err(RouteError::EmptyParameter {
                    template: template.to_string(),
                });
            }
            if index == 0 {
                Ok(Segment::Dynamic)
            } else {
                Ok(Segment::Hybrid)
            }
        }
    }
}
