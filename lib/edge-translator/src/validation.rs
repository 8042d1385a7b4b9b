//! Proxy validation
//!
//! Structural problems that make a Proxy unservable. Listener and virtual
//! host checks are reported directly; route checks are returned to the
//! translator, which either reports them or replaces the route.

use crate::reporter::ProxyReporter;
use crate::TranslateError;
use edge_api::v1::proxy::{
    Action, HttpListener, ListenerType, MatchedListenerType, Matcher, PathMatcher, Route, RouteAction,
};
use edge_api::{Proxy, ResourceRef};
use edge_core::ApiSnapshot;
use ipnetwork::IpNetwork;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

pub fn validate_proxy(proxy: &Proxy, reporter: &mut ProxyReporter<'_>) {
    let mut by_address: BTreeMap<(String, u16), Vec<&str>> = BTreeMap::new();
    let mut by_name: HashMap<&str, usize> = HashMap::new();

    for listener in &proxy.spec.listeners {
        by_address
            .entry((listener.bind_address.clone(), listener.bind_port))
            .or_default()
            .push(&listener.name);
        *by_name.entry(listener.name.as_str()).or_default() += 1;

        match &listener.listener_type {
            ListenerType::Http(http) => validate_http_listener(&listener.name, http, reporter),
            ListenerType::Tcp(_) => {}
            ListenerType::Hybrid(hybrid) => {
                for matched in &hybrid.matched_listeners {
                    for range in &matched.matcher.source_prefix_ranges {
                        if let Err(e) = IpNetwork::from_str(range) {
                            reporter.listener_error(
                                &listener.name,
                                format!("listener {} has invalid source prefix range {}: {}", listener.name, range, e),
                            );
                        }
                    }
                    if let MatchedListenerType::Http(http) = &matched.listener {
                        validate_http_listener(&listener.name, http, reporter);
                    }
                }
            }
        }
    }

    for ((address, port), names) in &by_address {
        if names.len() < 2 {
            continue;
        }
        for name in names {
            reporter.listener_error(
                name,
                format!("listener {} has duplicate bind address {}:{}", name, address, port),
            );
        }
    }

    for (name, count) in by_name {
        if count > 1 {
            reporter.listener_error(name, format!("listener name {} is not unique", name));
        }
    }
}

fn validate_http_listener(listener: &str, http: &HttpListener, reporter: &mut ProxyReporter<'_>) {
    let mut domains: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut names: HashMap<&str, usize> = HashMap::new();

    for vh in &http.virtual_hosts {
        *names.entry(vh.name.as_str()).or_default() += 1;
        if vh.domains.is_empty() {
            domains.entry("*").or_default().push(&vh.name);
        }
        for domain in &vh.domains {
            domains.entry(domain.as_str()).or_default().push(&vh.name);
        }
    }

    for (name, count) in names {
        if count > 1 {
            reporter.virtual_host_error(listener, name, format!("virtual host name {} is not unique", name));
        }
    }

    for (domain, hosts) in domains {
        if hosts.len() < 2 {
            continue;
        }
        for host in &hosts {
            reporter.virtual_host_error(
                listener,
                host,
                format!(
                    "domain {} is present in more than one virtual host of listener {}: {:?}",
                    domain, listener, hosts
                ),
            );
        }
    }
}

/// Problems that make a single route untranslatable
///
/// Destinations without a namespace resolve in `namespace`.
pub fn route_errors(route: &Route, snapshot: &ApiSnapshot, namespace: &str) -> Vec<TranslateError> {
    let mut errors = Vec::new();

    for matcher in &route.matchers {
        if let Err(e) = compile_matcher(matcher) {
            errors.push(e);
        }
    }

    let check_upstream = |upstream: &ResourceRef, errors: &mut Vec<TranslateError>| {
        let upstream = upstream.in_namespace(namespace);
        if snapshot.upstream(&upstream).is_none() {
            errors.push(TranslateError::UpstreamNotFound(upstream));
        }
    };

    match &route.action {
        None => errors.push(TranslateError::InvalidConfiguration(format!(
            "route {} has no action",
            route.name.as_deref().unwrap_or("<unnamed>")
        ))),
        Some(Action::Route(RouteAction::Single(dest))) => check_upstream(&dest.upstream, &mut errors),
        Some(Action::Route(RouteAction::Multi(dests))) => {
            if dests.is_empty() || dests.iter().map(|d| d.weight as u64).sum::<u64>() == 0 {
                errors.push(TranslateError::InvalidConfiguration(
                    "multi destination has zero total weight".into(),
                ));
            }
            for dest in dests {
                check_upstream(&dest.destination.upstream, &mut errors);
            }
        }
        Some(Action::Route(RouteAction::DynamicForwardProxy)) => {}
        Some(Action::Redirect(_)) => {}
        Some(Action::DirectResponse(direct)) => {
            if !(100..=599).contains(&direct.status) {
                errors.push(TranslateError::InvalidConfiguration(format!(
                    "direct response status {} is not a valid HTTP status",
                    direct.status
                )));
            }
        }
    }
    errors
}

/// Compile every regex a matcher uses
pub fn compile_matcher(matcher: &Matcher) -> Result<(), TranslateError> {
    let invalid = |pattern: &str, e: regex::Error| {
        TranslateError::InvalidConfiguration(format!("invalid regex {}: {}", pattern, e))
    };
    if let Some(PathMatcher::Regex(pattern)) = &matcher.path {
        Regex::new(pattern).map_err(|e| invalid(pattern, e))?;
    }
    for header in matcher.headers.iter().filter(|h| h.regex) {
        if let Some(pattern) = &header.value {
            Regex::new(pattern).map_err(|e| invalid(pattern, e))?;
        }
    }
    for param in matcher.query_parameters.iter().filter(|q| q.regex) {
        if let Some(pattern) = &param.value {
            Regex::new(pattern).map_err(|e| invalid(pattern, e))?;
        }
    }
    Ok(())
}
