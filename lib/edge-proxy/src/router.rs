//! Virtual host and route matching
//!
//! A [`Router`] is compiled from one route configuration of a snapshot.
//! Virtual hosts are chosen by the most specific domain match against the
//! request authority with any port removed: exact names beat `*.suffix`
//! wildcards, which beat `prefix*` wildcards, which beat `*`. Longer
//! wildcards win within a class. Routes of the chosen host are evaluated in
//! order and the first match wins.

use crate::cors::CorsEvaluator;
use crate::dlp::DlpMasker;
use crate::Result;
use edge_api::v1::proxy::{HeaderMatcher, Matcher, PathMatcher, QueryParameterMatcher};
use edge_api::xds::{EnvoyRoute, EnvoyVirtualHost, RouteConfiguration};
use hyper::header::HOST;
use hyper::{HeaderMap, Method, Request};
use regex::Regex;
use tracing::debug;

/// The parts of a request route matching looks at
#[derive(Clone, Copy)]
pub struct RequestInfo<'a> {
    pub authority: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
}

impl<'a> RequestInfo<'a> {
    pub fn from_request<B>(req: &'a Request<B>) -> Self {
        let authority = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or("");
        Self {
            authority,
            path: req.uri().path(),
            query: req.uri().query(),
            method: req.method(),
            headers: req.headers(),
        }
    }
}

/// A matcher with its regexes compiled
#[derive(Debug)]
pub struct CompiledMatcher {
    path: PathMatch,
    headers: Vec<CompiledHeader>,
    query_parameters: Vec<CompiledQuery>,
    methods: Vec<String>,
}

#[derive(Debug)]
enum PathMatch {
    Prefix(String),
    Exact(String),
    Regex(Regex),
}

#[derive(Debug)]
enum ValueMatch {
    Present,
    Exact(String),
    Regex(Regex),
}

#[derive(Debug)]
struct CompiledHeader {
    name: String,
    value: ValueMatch,
    invert: bool,
}

#[derive(Debug)]
struct CompiledQuery {
    name: String,
    value: ValueMatch,
}

/// Regexes must match the whole input
fn full_match(regex: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{})$", regex))?)
}

impl ValueMatch {
    fn compile(value: &Option<String>, regex: bool) -> Result<Self> {
        Ok(match value {
            None => ValueMatch::Present,
            Some(v) if regex => ValueMatch::Regex(full_match(v)?),
            Some(v) => ValueMatch::Exact(v.clone()),
        })
    }

    fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (_, None) => false,
            (ValueMatch::Present, Some(_)) => true,
            (ValueMatch::Exact(expected), Some(v)) => expected == v,
            (ValueMatch::Regex(re), Some(v)) => re.is_match(v),
        }
    }
}

impl CompiledMatcher {
    pub fn new(matcher: &Matcher) -> Result<Self> {
        let path = match matcher.path_or_default() {
            PathMatcher::Prefix(p) => PathMatch::Prefix(p),
            PathMatcher::Exact(p) => PathMatch::Exact(p),
            PathMatcher::Regex(r) => PathMatch::Regex(full_match(&r)?),
        };
        let headers = matcher
            .headers
            .iter()
            .map(|h: &HeaderMatcher| {
                Ok(CompiledHeader {
                    name: h.name.to_ascii_lowercase(),
                    value: ValueMatch::compile(&h.value, h.regex)?,
                    invert: h.invert_match,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let query_parameters = matcher
            .query_parameters
            .iter()
            .map(|q: &QueryParameterMatcher| {
                Ok(CompiledQuery {
                    name: q.name.clone(),
                    value: ValueMatch::compile(&q.value, q.regex)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path,
            headers,
            query_parameters,
            methods: matcher.methods.clone(),
        })
    }

    pub fn matches(&self, req: &RequestInfo<'_>) -> bool {
        let path_ok = match &self.path {
            PathMatch::Prefix(p) => req.path.starts_with(p.as_str()),
            PathMatch::Exact(p) => req.path == p,
            PathMatch::Regex(re) => re.is_match(req.path),
        };
        if !path_ok {
            return false;
        }

        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(req.method.as_str()))
        {
            return false;
        }

        let headers_ok = self.headers.iter().all(|h| {
            let value = req.headers.get(h.name.as_str()).and_then(|v| v.to_str().ok());
            h.value.matches(value) != h.invert
        });
        if !headers_ok {
            return false;
        }

        self.query_parameters
            .iter()
            .all(|q| q.value.matches(query_param(req.query, &q.name)))
    }

    /// The matched prefix, used by prefix rewrites
    pub fn prefix(&self) -> Option<&str> {
        match &self.path {
            PathMatch::Prefix(p) => Some(p),
            _ => None,
        }
    }
}

fn query_param<'q>(query: Option<&'q str>, name: &str) -> Option<&'q str> {
    query?.split('&').find_map(|pair| match pair.split_once('=') {
        Some((k, v)) if k == name => Some(v),
        None if pair == name => Some(""),
        _ => None,
    })
}

/// How well a domain pattern matches a host; greater is more specific
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DomainMatch {
    Any,
    Prefix(usize),
    Suffix(usize),
    Exact,
}

fn match_domain(pattern: &str, host: &str) -> Option<DomainMatch> {
    if pattern == "*" {
        return Some(DomainMatch::Any);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return (host.len() > suffix.len() && host.ends_with(suffix))
            .then_some(DomainMatch::Suffix(suffix.len()));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return (host.len() > prefix.len() && host.starts_with(prefix))
            .then_some(DomainMatch::Prefix(prefix.len()));
    }
    (pattern == host).then_some(DomainMatch::Exact)
}

/// Host part of an authority, lower-cased, without a port
pub fn strip_port(authority: &str) -> String {
    let host = if authority.starts_with('[') {
        match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => authority,
        }
    };
    host.to_ascii_lowercase()
}

/// A route together with its compiled matcher and per-route filters
pub struct CompiledRoute {
    pub route: EnvoyRoute,
    pub matcher: CompiledMatcher,
    pub cors: Option<CorsEvaluator>,
    pub dlp: Option<DlpMasker>,
}

impl CompiledRoute {
    fn new(route: &EnvoyRoute) -> Result<Self> {
        let cors = match &route.policies.cors {
            Some(policy) if !policy.disable_for_route => Some(CorsEvaluator::new(policy)?),
            _ => None,
        };
        let dlp = match &route.policies.dlp {
            Some(config) if !config.actions.is_empty() => {
                Some(DlpMasker::new(&config.actions, config.enabled_for)?)
            }
            _ => None,
        };
        Ok(Self {
            route: route.clone(),
            matcher: CompiledMatcher::new(&route.matcher)?,
            cors,
            dlp,
        })
    }

    pub fn name(&self) -> &str {
        &self.route.name
    }
}

pub struct CompiledVirtualHost {
    pub name: String,
    domains: Vec<String>,
    pub routes: Vec<CompiledRoute>,
}

impl CompiledVirtualHost {
    fn new(vhost: &EnvoyVirtualHost) -> Result<Self> {
        Ok(Self {
            name: vhost.name.clone(),
            domains: vhost.domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
            routes: vhost
                .routes
                .iter()
                .map(CompiledRoute::new)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn best_match(&self, host: &str) -> Option<DomainMatch> {
        self.domains.iter().filter_map(|d| match_domain(d, host)).max()
    }
}

pub struct RouteMatch<'a> {
    pub virtual_host: &'a str,
    pub route: &'a CompiledRoute,
}

/// Compiled route configuration
pub struct Router {
    name: String,
    virtual_hosts: Vec<CompiledVirtualHost>,
}

impl Router {
    pub fn new(config: &RouteConfiguration) -> Result<Self> {
        let virtual_hosts = config
            .virtual_hosts
            .iter()
            .map(CompiledVirtualHost::new)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            route_config = %config.name,
            virtual_hosts = virtual_hosts.len(),
            "Compiled route configuration"
        );
        Ok(Self {
            name: config.name.clone(),
            virtual_hosts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Most specific virtual host for an authority; ties go to the first
    pub fn select_virtual_host(&self, authority: &str) -> Option<&CompiledVirtualHost> {
        let host = strip_port(authority);
        let mut best: Option<(DomainMatch, &CompiledVirtualHost)> = None;
        for vhost in &self.virtual_hosts {
            if let Some(m) = vhost.best_match(&host) {
                if best.map_or(true, |(current, _)| m > current) {
                    best = Some((m, vhost));
                }
            }
        }
        best.map(|(_, vhost)| vhost)
    }

    pub fn route(&self, req: &RequestInfo<'_>) -> Option<RouteMatch<'_>> {
        let vhost = self.select_virtual_host(req.authority)?;
        let route = vhost.routes.iter().find(|r| r.matcher.matches(req))?;
        Some(RouteMatch {
            virtual_host: &vhost.name,
            route,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::options::CorsPolicy;
    use edge_api::xds::{EnvoyAction, RoutePolicies};

    fn route(name: &str, matcher: Matcher) -> EnvoyRoute {
        EnvoyRoute {
            name: name.to_string(),
            matcher,
            action: EnvoyAction::Cluster(format!("{}_default", name)),
            policies: RoutePolicies::default(),
        }
    }

    fn vhost(name: &str, domains: &[&str], routes: Vec<EnvoyRoute>) -> EnvoyVirtualHost {
        EnvoyVirtualHost {
            name: name.to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            routes,
        }
    }

    fn router(vhosts: Vec<EnvoyVirtualHost>) -> Router {
        Router::new(&RouteConfiguration {
            name: "listener-routes".into(),
            virtual_hosts: vhosts,
        })
        .unwrap()
    }

    fn request(authority: &str, uri: &str) -> Request<()> {
        Request::builder()
            .uri(uri)
            .header(HOST, authority)
            .body(())
            .unwrap()
    }

    fn route_name(router: &Router, req: &Request<()>) -> Option<String> {
        router
            .route(&RequestInfo::from_request(req))
            .map(|m| m.route.name().to_string())
    }

    #[test]
    fn test_domain_specificity() {
        let router = router(vec![
            vhost("any", &["*"], vec![route("any", Matcher::default())]),
            vhost("prefix", &["api.*"], vec![route("prefix", Matcher::default())]),
            vhost("suffix", &["*.example.com"], vec![route("suffix", Matcher::default())]),
            vhost(
                "longer-suffix",
                &["*.api.example.com"],
                vec![route("longer-suffix", Matcher::default())],
            ),
            vhost("exact", &["www.example.com"], vec![route("exact", Matcher::default())]),
        ]);

        let pick = |authority: &str| {
            router
                .select_virtual_host(authority)
                .map(|v| v.name.clone())
                .unwrap()
        };
        assert_eq!(pick("www.example.com"), "exact");
        assert_eq!(pick("WWW.Example.com:8080"), "exact");
        assert_eq!(pick("foo.example.com"), "suffix");
        assert_eq!(pick("v1.api.example.com"), "longer-suffix");
        assert_eq!(pick("api.internal"), "prefix");
        assert_eq!(pick("other.org"), "any");
    }

    #[test]
    fn test_no_matching_domain() {
        let router = router(vec![vhost(
            "exact",
            &["example.com"],
            vec![route("r", Matcher::default())],
        )]);
        assert!(router.select_virtual_host("other.com").is_none());
        assert!(route_name(&router, &request("other.com", "/")).is_none());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("Example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_first_match_wins() {
        let router = router(vec![vhost(
            "vh",
            &["*"],
            vec![
                route("exact", Matcher::exact("/api")),
                route("prefix", Matcher::prefix("/api")),
                route("regex", Matcher::regex("/items/[0-9]+")),
                route("root", Matcher::default()),
            ],
        )]);

        assert_eq!(route_name(&router, &request("a", "/api")).unwrap(), "exact");
        assert_eq!(route_name(&router, &request("a", "/api/v1")).unwrap(), "prefix");
        assert_eq!(route_name(&router, &request("a", "/items/42")).unwrap(), "regex");
        // regex must match the whole path
        assert_eq!(route_name(&router, &request("a", "/items/42/x")).unwrap(), "root");
    }

    #[test]
    fn test_header_query_and_method_matching() {
        let matcher = Matcher {
            headers: vec![
                HeaderMatcher {
                    name: "x-version".into(),
                    value: Some("v[0-9]".into()),
                    regex: true,
                    invert_match: false,
                },
                HeaderMatcher {
                    name: "x-debug".into(),
                    value: None,
                    regex: false,
                    invert_match: true,
                },
            ],
            query_parameters: vec![QueryParameterMatcher {
                name: "user".into(),
                value: Some("alice".into()),
                regex: false,
            }],
            methods: vec!["GET".into()],
            ..Matcher::prefix("/")
        };
        let router = router(vec![vhost(
            "vh",
            &["*"],
            vec![route("guarded", matcher), route("fallback", Matcher::default())],
        )]);

        let ok = Request::builder()
            .uri("/x?user=alice&page=2")
            .header(HOST, "a")
            .header("x-version", "v2")
            .body(())
            .unwrap();
        assert_eq!(route_name(&router, &ok).unwrap(), "guarded");

        let with_debug = Request::builder()
            .uri("/x?user=alice")
            .header(HOST, "a")
            .header("x-version", "v2")
            .header("x-debug", "1")
            .body(())
            .unwrap();
        assert_eq!(route_name(&router, &with_debug).unwrap(), "fallback");

        let wrong_query = Request::builder()
            .uri("/x?user=bob")
            .header(HOST, "a")
            .header("x-version", "v2")
            .body(())
            .unwrap();
        assert_eq!(route_name(&router, &wrong_query).unwrap(), "fallback");

        let post = Request::builder()
            .method(Method::POST)
            .uri("/x?user=alice")
            .header(HOST, "a")
            .header("x-version", "v2")
            .body(())
            .unwrap();
        assert_eq!(route_name(&router, &post).unwrap(), "fallback");
    }

    #[test]
    fn test_prefix_for_rewrite() {
        let matcher = CompiledMatcher::new(&Matcher::prefix("/api")).unwrap();
        assert_eq!(matcher.prefix(), Some("/api"));
        let matcher = CompiledMatcher::new(&Matcher::exact("/api")).unwrap();
        assert_eq!(matcher.prefix(), None);
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        let result = Router::new(&RouteConfiguration {
            name: "routes".into(),
            virtual_hosts: vec![vhost("vh", &["*"], vec![route("bad", Matcher::regex("(["))])],
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_route_filters_compiled() {
        let mut with_cors = route("cors", Matcher::default());
        with_cors.policies.cors = Some(CorsPolicy {
            allow_origin: vec!["https://app.example.com".into()],
            ..Default::default()
        });
        let mut disabled = route("disabled", Matcher::prefix("/off"));
        disabled.policies.cors = Some(CorsPolicy {
            disable_for_route: true,
            ..Default::default()
        });
        let router = router(vec![vhost("vh", &["*"], vec![disabled, with_cors])]);

        let vhost = router.select_virtual_host("a").unwrap();
        assert!(vhost.routes[0].cors.is_none());
        assert!(vhost.routes[1].cors.is_some());
    }
}
