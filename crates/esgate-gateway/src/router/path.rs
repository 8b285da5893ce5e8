//! Pattern-based path router with a single fallback handler.
//!
//! Patterns are `/`-separated segments where `:name` captures one segment and
//! a trailing `*` captures the rest of the path (stored under the `*` param):
//!
//! | Pattern | Path | Params |
//! |---------|------|--------|
//! | `/_bulk` | `/_bulk` | – |
//! | `/:index/_search` | `/logs/_search` | `index → logs` |
//! | `/_plugins/*` | `/_plugins/a/b` | `* → a/b` |
//!
//! Routes are scanned in registration order. The first route whose *path*
//! matches decides the outcome: if its predicate rejects the request the
//! router reports no match rather than trying later routes.

use crate::pipeline::PipelineStages;
use esgate_kernel::pipeline::matcher::{self, RequestMatcher};
use esgate_kernel::pipeline::types::normalize_path;
use esgate_kernel::pipeline::{FrontendHandler, PipelineError, Request};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Param name under which a trailing `*` stores the remaining path.
pub const WILDCARD_PARAM: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

fn compile(pattern: &str) -> Result<Vec<Segment>, PipelineError> {
    let invalid = |reason: &str| PipelineError::InvalidRoutePattern(pattern.to_string(), reason.to_string());

    if !pattern.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    let normalized = normalize_path(pattern);
    if normalized == "/" {
        return Ok(Vec::new());
    }

    let raw: Vec<&str> = normalized[1..].split('/').collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, seg) in raw.iter().enumerate() {
        let segment = if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid("parameter segment has no name"));
            }
            Segment::Param(name.to_string())
        } else if *seg == "*" {
            if i + 1 != raw.len() {
                return Err(invalid("'*' is only allowed as the last segment"));
            }
            Segment::Wildcard
        } else if seg.is_empty() {
            return Err(invalid("empty path segment"));
        } else {
            Segment::Literal(seg.to_string())
        };
        segments.push(segment);
    }
    Ok(segments)
}

fn match_segments(segments: &[Segment], path: &str) -> Option<HashMap<String, String>> {
    let parts: Vec<&str> = if path == "/" || path.is_empty() {
        Vec::new()
    } else {
        path.trim_start_matches('/').split('/').collect()
    };

    let mut params = HashMap::new();
    for (i, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Wildcard => {
                let rest = parts.get(i..).map(|r| r.join("/")).unwrap_or_default();
                params.insert(WILDCARD_PARAM.to_string(), rest);
                return Some(params);
            }
            Segment::Param(name) => {
                let value = parts.get(i).filter(|v| !v.is_empty())?;
                params.insert(name.clone(), (*value).to_string());
            }
            Segment::Literal(lit) => {
                if parts.get(i) != Some(&lit.as_str()) {
                    return None;
                }
            }
        }
    }
    (parts.len() == segments.len()).then_some(params)
}

// ─────────────────────────────────────────────────────────────────────────────
// PathRoute
// ─────────────────────────────────────────────────────────────────────────────

/// One registered endpoint.
#[derive(Clone)]
pub struct PathRoute {
    pattern: String,
    segments: Vec<Segment>,
    predicate: Arc<dyn RequestMatcher>,
    handler: Arc<dyn FrontendHandler>,
    /// Processors and backends of the pipeline that declared this route.
    /// Bound while the runtime is built.
    stages: Option<Arc<PipelineStages>>,
}

impl PathRoute {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn handler(&self) -> &Arc<dyn FrontendHandler> {
        &self.handler
    }

    pub fn stages(&self) -> Option<&Arc<PipelineStages>> {
        self.stages.as_ref()
    }
}

/// Successful lookup: the route plus params captured from the path.
pub struct RouteMatch<'a> {
    pub route: &'a PathRoute,
    pub params: HashMap<String, String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// PathRouter
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct PathRouter {
    routes: Vec<PathRoute>,
    fallback: Option<Arc<dyn FrontendHandler>>,
    /// Malformed patterns seen at registration, reported by `validate`.
    errors: Vec<PipelineError>,
}

impl PathRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` with an always-true predicate.
    pub fn add_route(&mut self, pattern: &str, handler: Arc<dyn FrontendHandler>) -> &mut Self {
        self.register(pattern, matcher::always(), handler)
    }

    /// Register `pattern`; the route only matches requests `predicate` accepts.
    pub fn register(
        &mut self,
        pattern: &str,
        predicate: Arc<dyn RequestMatcher>,
        handler: Arc<dyn FrontendHandler>,
    ) -> &mut Self {
        match compile(pattern) {
            Ok(segments) => self.routes.push(PathRoute {
                pattern: normalize_path(pattern),
                segments,
                predicate,
                handler,
                stages: None,
            }),
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// Set the handler used when no route matches. Replaces any earlier one.
    pub fn add_fallback_handler(&mut self, handler: Arc<dyn FrontendHandler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    pub fn fallback(&self) -> Option<&Arc<dyn FrontendHandler>> {
        self.fallback.as_ref()
    }

    pub fn routes(&self) -> &[PathRoute] {
        &self.routes
    }

    /// Number of registered routes (the fallback is not counted).
    pub fn handler_count(&self) -> usize {
        self.routes.len()
    }

    /// First registration error, if any.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self.errors.first() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Resolve `req` against the registered routes.
    pub fn find(&self, req: &Request) -> Option<RouteMatch<'_>> {
        let path = normalize_path(&req.path);
        for route in &self.routes {
            if let Some(params) = match_segments(&route.segments, &path) {
                if route.predicate.matches(req) {
                    return Some(RouteMatch { route, params });
                }
                debug!(pattern = %route.pattern, path = %path, "path matched but predicate rejected request");
                return None;
            }
        }
        None
    }

    /// Append `other`'s routes after this router's own. `other`'s fallback is
    /// adopted only if this router has none.
    pub fn append(&mut self, other: PathRouter) {
        self.routes.extend(other.routes);
        self.errors.extend(other.errors);
        if self.fallback.is_none() {
            self.fallback = other.fallback;
        }
    }

    /// Attach `stages` to every route that has none yet.
    pub(crate) fn bind_stages(&mut self, stages: &Arc<PipelineStages>) {
        for route in self.routes.iter_mut().filter(|r| r.stages.is_none()) {
            route.stages = Some(Arc::clone(stages));
        }
    }
}
