//! Request predicates attached to routes.
//!
//! A route matches only when its path pattern matches *and* its
//! [`RequestMatcher`] accepts the request. Plain `add_route` registrations use
//! [`always()`].

use super::types::{HttpMethod, Request};
use std::sync::Arc;

/// Predicate evaluated against a request whose path already matched.
pub trait RequestMatcher: Send + Sync {
    fn matches(&self, req: &Request) -> bool;
}

impl<F> RequestMatcher for F
where
    F: Fn(&Request) -> bool + Send + Sync,
{
    fn matches(&self, req: &Request) -> bool {
        self(req)
    }
}

struct Always;

impl RequestMatcher for Always {
    fn matches(&self, _req: &Request) -> bool {
        true
    }
}

struct Never;

impl RequestMatcher for Never {
    fn matches(&self, _req: &Request) -> bool {
        false
    }
}

struct IsHttpMethod(Vec<HttpMethod>);

impl RequestMatcher for IsHttpMethod {
    fn matches(&self, req: &Request) -> bool {
        self.0.contains(&req.method)
    }
}

struct And(Vec<Arc<dyn RequestMatcher>>);

impl RequestMatcher for And {
    fn matches(&self, req: &Request) -> bool {
        self.0.iter().all(|m| m.matches(req))
    }
}

pub fn always() -> Arc<dyn RequestMatcher> {
    Arc::new(Always)
}

pub fn never() -> Arc<dyn RequestMatcher> {
    Arc::new(Never)
}

/// Accepts requests whose method is one of `methods`.
pub fn is_http_method(methods: impl IntoIterator<Item = HttpMethod>) -> Arc<dyn RequestMatcher> {
    Arc::new(IsHttpMethod(methods.into_iter().collect()))
}

/// Accepts requests accepted by every matcher in `matchers`.
pub fn and(matchers: impl IntoIterator<Item = Arc<dyn RequestMatcher>>) -> Arc<dyn RequestMatcher> {
    Arc::new(And(matchers.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_and_composition() {
        let get = Request::new("r", HttpMethod::Get, "/_search");
        let post = Request::new("r", HttpMethod::Post, "/_search");

        let m = is_http_method([HttpMethod::Get, HttpMethod::Post]);
        assert!(m.matches(&get) && m.matches(&post));

        let only_get = and([always(), is_http_method([HttpMethod::Get])]);
        assert!(only_get.matches(&get));
        assert!(!only_get.matches(&post));

        assert!(!and([always(), never()]).matches(&get));
    }

    #[test]
    fn closures_are_matchers() {
        let has_body: Arc<dyn RequestMatcher> = Arc::new(|r: &Request| !r.body.is_empty());
        let req = Request::new("r", HttpMethod::Post, "/_bulk").with_body("{}");
        assert!(has_body.matches(&req));
    }
}
