//! Gateway translator
//!
//! Renders Gateways and the VirtualServices they select into Proxies. Every
//! proxy name referenced by a Gateway yields one Proxy in the write namespace;
//! each Gateway contributes one listener to each of its proxies.
//!
//! VirtualServices with errors are left out of the generated listeners so a
//! single bad VirtualService cannot take down its neighbours.

use crate::reporter::ProxySources;
use crate::validation::compile_matcher;
use edge_api::v1::gateway::{GatewayType, HttpGateway, MatchedGatewayType, TcpGateway};
use edge_api::v1::options::{ProxyProtocol, SslConfig};
use edge_api::v1::proxy::{
    Action, HttpListener, HybridListener, Listener, ListenerType, MatchedListener, MatchedListenerType, Matcher,
    PathMatcher, ProxySpec, Route, RouteAction, TcpListener, VirtualHost,
};
use edge_api::v1::{CREATED_BY_LABEL, CREATED_BY_VALUE};
use edge_api::{Gateway, Proxy, ResourceRef, VirtualService};
use edge_core::settings::Settings;
use edge_core::{ApiSnapshot, ResourceKind, ResourceReports};
use kube::ResourceExt;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// A Proxy produced from Gateways, with the resources each part came from
#[derive(Clone, Debug)]
pub struct GeneratedProxy {
    pub proxy: Proxy,
    pub sources: ProxySources,
}

impl GeneratedProxy {
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::of(&self.proxy)
    }
}

#[derive(Clone, Debug)]
pub struct GatewayTranslator {
    write_namespace: String,
    read_gateways_from_all_namespaces: bool,
    default_proxy_name: String,
}

impl GatewayTranslator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            write_namespace: settings.write_namespace.clone(),
            read_gateways_from_all_namespaces: settings.gateway.read_gateways_from_all_namespaces,
            default_proxy_name: settings.gateway.default_proxy_name.clone(),
        }
    }

    /// Generate the desired proxies
    ///
    /// Every Gateway and VirtualService in the snapshot is tracked in
    /// `reports`, so each one ends up with a status.
    pub fn translate(&self, snapshot: &ApiSnapshot, reports: &mut ResourceReports) -> Vec<GeneratedProxy> {
        for vs in &snapshot.virtual_services {
            reports.accept(ResourceKind::VirtualService, &ResourceRef::of(vs));
        }

        let mut by_proxy: BTreeMap<String, Vec<&Gateway>> = BTreeMap::new();
        for gateway in &snapshot.gateways {
            let gateway_ref = ResourceRef::of(gateway);
            reports.accept(ResourceKind::Gateway, &gateway_ref);

            if !self.read_gateways_from_all_namespaces && gateway_ref.namespace != self.write_namespace {
                reports.add_warning(
                    ResourceKind::Gateway,
                    &gateway_ref,
                    format!(
                        "gateway is ignored: only gateways in namespace {} are read",
                        self.write_namespace
                    ),
                );
                continue;
            }

            if gateway.spec.proxy_names.is_empty() {
                by_proxy.entry(self.default_proxy_name.clone()).or_default().push(gateway);
            }
            for name in &gateway.spec.proxy_names {
                by_proxy.entry(name.clone()).or_default().push(gateway);
            }
        }

        by_proxy
            .into_iter()
            .map(|(proxy_name, gateways)| self.generate_proxy(&proxy_name, &gateways, snapshot, reports))
            .collect()
    }

    fn generate_proxy(
        &self,
        proxy_name: &str,
        gateways: &[&Gateway],
        snapshot: &ApiSnapshot,
        reports: &mut ResourceReports,
    ) -> GeneratedProxy {
        let mut sources = ProxySources::default();
        let mut listeners = Vec::with_capacity(gateways.len());

        let mut by_address: BTreeMap<(&str, u16), Vec<ResourceRef>> = BTreeMap::new();
        for gateway in gateways {
            by_address
                .entry((gateway.spec.bind_address.as_str(), gateway.spec.bind_port))
                .or_default()
                .push(ResourceRef::of(*gateway));
        }
        for ((address, port), owners) in &by_address {
            if owners.len() < 2 {
                continue;
            }
            let keys: Vec<String> = owners.iter().map(|o| o.key()).collect();
            for owner in owners {
                reports.add_error(
                    ResourceKind::Gateway,
                    owner,
                    format!(
                        "bind address {}:{} is used by more than one gateway of proxy {}: {:?}",
                        address, port, proxy_name, keys
                    ),
                );
            }
        }

        for gateway in gateways {
            let listener = self.gateway_listener(gateway, snapshot, reports, &mut sources);
            sources
                .listeners
                .insert(listener.name.clone(), ResourceRef::of(*gateway));
            listeners.push(listener);
        }

        let mut proxy = Proxy::new(proxy_name, ProxySpec { listeners });
        proxy.metadata.namespace = Some(self.write_namespace.clone());
        proxy
            .labels_mut()
            .insert(CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string());

        debug!(
            proxy = %proxy_name,
            listeners = proxy.spec.listeners.len(),
            "Generated proxy from gateways"
        );
        GeneratedProxy { proxy, sources }
    }

    fn gateway_listener(
        &self,
        gateway: &Gateway,
        snapshot: &ApiSnapshot,
        reports: &mut ResourceReports,
        sources: &mut ProxySources,
    ) -> Listener {
        let spec = &gateway.spec;
        let namespace = gateway.namespace().unwrap_or_default();

        let mut options = spec.options.clone();
        if spec.use_proxy_proto == Some(true) && options.proxy_protocol.is_none() {
            options.proxy_protocol = Some(ProxyProtocol::default());
        }

        let (listener_type, ssl_configurations) = match &spec.gateway_type {
            GatewayType::Http(http) => {
                let (listener, ssl) = self.http_listener(gateway, http, spec.ssl, snapshot, reports, sources);
                (ListenerType::Http(listener), ssl)
            }
            GatewayType::Tcp(tcp) => (ListenerType::Tcp(tcp_listener(tcp, &namespace)), Vec::new()),
            GatewayType::Hybrid(hybrid) => {
                let matched_listeners = hybrid
                    .matched_gateways
                    .iter()
                    .map(|matched| {
                        let listener = match &matched.gateway {
                            MatchedGatewayType::Http(http) => {
                                let ssl = matched.matcher.ssl_config.is_some();
                                let (listener, _) =
                                    self.http_listener(gateway, http, ssl, snapshot, reports, sources);
                                MatchedListenerType::Http(listener)
                            }
                            MatchedGatewayType::Tcp(tcp) => MatchedListenerType::Tcp(tcp_listener(tcp, &namespace)),
                        };
                        let mut matcher = matched.matcher.clone();
                        if let Some(ssl) = &mut matcher.ssl_config {
                            namespace_secret(ssl, &namespace);
                        }
                        MatchedListener { matcher, listener }
                    })
                    .collect();
                (ListenerType::Hybrid(HybridListener { matched_listeners }), Vec::new())
            }
        };

        Listener {
            name: listener_name(gateway),
            bind_address: spec.bind_address.clone(),
            bind_port: spec.bind_port,
            listener_type,
            ssl_configurations,
            options,
        }
    }

    fn http_listener(
        &self,
        gateway: &Gateway,
        http: &HttpGateway,
        ssl: bool,
        snapshot: &ApiSnapshot,
        reports: &mut ResourceReports,
        sources: &mut ProxySources,
    ) -> (HttpListener, Vec<SslConfig>) {
        let selected = select_virtual_services(gateway, http, ssl, snapshot, reports);
        validate_domains(gateway, &selected, reports);

        let mut virtual_hosts = Vec::new();
        let mut ssl_configurations: Vec<SslConfig> = Vec::new();
        for vs in selected {
            let vs_ref = ResourceRef::of(vs);
            let Some(host) = &vs.spec.virtual_host else {
                reports.add_warning(
                    ResourceKind::VirtualService,
                    &vs_ref,
                    format!("virtual service [{}] does not specify a virtual host", vs_ref.key()),
                );
                continue;
            };

            let virtual_host = VirtualHost {
                name: virtual_host_name(vs),
                domains: host.domains.clone(),
                routes: host
                    .routes
                    .iter()
                    .map(|r| namespaced_route(r, &vs_ref.namespace))
                    .collect(),
                options: host.options.clone(),
            };
            validate_routes(&vs_ref, &virtual_host, reports);
            if reports.has_errors(ResourceKind::VirtualService, &vs_ref) {
                continue;
            }

            if ssl {
                if let Some(config) = &vs.spec.ssl_config {
                    let mut config = config.clone();
                    namespace_secret(&mut config, &vs_ref.namespace);
                    if !ssl_configurations.contains(&config) {
                        ssl_configurations.push(config);
                    }
                }
            }
            sources.virtual_hosts.insert(virtual_host.name.clone(), vs_ref);
            virtual_hosts.push(virtual_host);
        }

        let listener = HttpListener {
            virtual_hosts,
            options: http.options.clone(),
        };
        (listener, ssl_configurations)
    }
}

/// `listener-{bind_address}-{bind_port}`
pub fn listener_name(gateway: &Gateway) -> String {
    format!("listener-{}-{}", gateway.spec.bind_address, gateway.spec.bind_port)
}

/// `{namespace}.{name}`
pub fn virtual_host_name(vs: &VirtualService) -> String {
    ResourceRef::of(vs).key()
}

fn namespace_secret(ssl: &mut SslConfig, namespace: &str) {
    if let Some(secret) = &ssl.secret_ref {
        ssl.secret_ref = Some(secret.in_namespace(namespace));
    }
}

fn tcp_listener(tcp: &TcpGateway, namespace: &str) -> TcpListener {
    let mut tcp_hosts = tcp.tcp_hosts.clone();
    for host in &mut tcp_hosts {
        host.destination.upstream = host.destination.upstream.in_namespace(namespace);
        if let Some(ssl) = &mut host.ssl_config {
            namespace_secret(ssl, namespace);
        }
    }
    TcpListener {
        tcp_hosts,
        stat_prefix: tcp.stat_prefix.clone(),
    }
}

/// Upstream references without a namespace resolve in the VirtualService's
fn namespaced_route(route: &Route, namespace: &str) -> Route {
    let mut route = route.clone();
    if let Some(Action::Route(action)) = &mut route.action {
        match action {
            RouteAction::Single(dest) => dest.upstream = dest.upstream.in_namespace(namespace),
            RouteAction::Multi(dests) => {
                for dest in dests {
                    dest.destination.upstream = dest.destination.upstream.in_namespace(namespace);
                }
            }
            RouteAction::DynamicForwardProxy => {}
        }
    }
    route
}

/// Explicit references win; otherwise a label selector and namespace list
/// pick VirtualServices. SSL gateways only take VirtualServices with an SSL
/// config and plaintext gateways only those without.
fn select_virtual_services<'a>(
    gateway: &Gateway,
    http: &HttpGateway,
    ssl: bool,
    snapshot: &'a ApiSnapshot,
    reports: &mut ResourceReports,
) -> Vec<&'a VirtualService> {
    let gateway_ref = ResourceRef::of(gateway);
    let ssl_matches = |vs: &VirtualService| vs.spec.ssl_config.is_some() == ssl;

    if !http.virtual_services.is_empty() {
        let mut selected = Vec::new();
        for reference in &http.virtual_services {
            let reference = reference.in_namespace(&gateway_ref.namespace);
            match snapshot.virtual_service(&reference) {
                Some(vs) if ssl_matches(vs) => selected.push(vs),
                Some(_) => {}
                None => reports.add_warning(
                    ResourceKind::Gateway,
                    &gateway_ref,
                    format!("virtual service {} not found", reference),
                ),
            }
        }
        return selected;
    }

    snapshot
        .virtual_services
        .iter()
        .filter(|vs| ssl_matches(vs))
        .filter(|vs| {
            let labels = vs.labels();
            http.virtual_service_selector
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
        })
        .filter(|vs| namespace_selected(&http.virtual_service_namespaces, vs))
        .collect()
}

/// Empty selects every namespace
fn namespace_selected(namespaces: &[String], vs: &VirtualService) -> bool {
    if namespaces.is_empty() {
        return true;
    }
    let vs_namespace = vs.namespace().unwrap_or_default();
    namespaces.iter().any(|ns| ns == "*" || *ns == vs_namespace)
}

/// Domains must be unique across the VirtualServices of one gateway; a
/// VirtualService without domains claims `*`
fn validate_domains(gateway: &Gateway, virtual_services: &[&VirtualService], reports: &mut ResourceReports) {
    let mut by_domain: BTreeMap<&str, Vec<ResourceRef>> = BTreeMap::new();
    for vs in virtual_services {
        let Some(host) = &vs.spec.virtual_host else {
            continue;
        };
        if host.domains.is_empty() {
            by_domain.entry("").or_default().push(ResourceRef::of(*vs));
        }
        for domain in &host.domains {
            by_domain.entry(domain.as_str()).or_default().push(ResourceRef::of(*vs));
        }
    }

    let mut conflicting = Vec::new();
    for (domain, owners) in &by_domain {
        if owners.len() < 2 {
            continue;
        }
        conflicting.push(if domain.is_empty() { "EMPTY_DOMAIN" } else { domain });
        for (i, owner) in owners.iter().enumerate() {
            let others: Vec<String> = owners
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, o)| o.key())
                .collect();
            let err = if domain.is_empty() {
                format!(
                    "domain conflict: other virtual services that belong to the same Gateway as this one \
                     don't specify a domain (and thus default to '*'): {:?}",
                    others
                )
            } else {
                format!(
                    "domain conflict: the [{}] domain is present in other virtual services that belong to \
                     the same Gateway as this one: {:?}",
                    domain, others
                )
            };
            reports.add_error(ResourceKind::VirtualService, owner, err);
        }
    }

    if !conflicting.is_empty() {
        reports.add_error(
            ResourceKind::Gateway,
            &ResourceRef::of(gateway),
            format!(
                "domain conflict: the following domains are present in more than one of the virtual services \
                 associated with this gateway: {:?}",
                conflicting
            ),
        );
    }
}

/// Regex errors reject the VirtualService; shadowed routes only warn
fn validate_routes(vs: &ResourceRef, virtual_host: &VirtualHost, reports: &mut ResourceReports) {
    let matchers: Vec<Matcher> = virtual_host
        .routes
        .iter()
        .flat_map(|r| {
            if r.matchers.is_empty() {
                vec![Matcher::default()]
            } else {
                r.matchers.clone()
            }
        })
        .collect();

    for matcher in &matchers {
        if let Err(e) = compile_matcher(matcher) {
            reports.add_error(
                ResourceKind::VirtualService,
                vs,
                format!("virtual service [{}] has a regex matcher with invalid regex, {}", vs.key(), e),
            );
        }
    }

    let mut seen = HashSet::new();
    for matcher in &matchers {
        if !seen.insert(matcher) {
            reports.add_warning(
                ResourceKind::VirtualService,
                vs,
                format!("virtual host [{}] has conflicting matcher: {:?}", virtual_host.name, matcher),
            );
        }
    }

    for (i, later) in matchers.iter().enumerate() {
        let later_path = path_string(later);
        for earlier in &matchers[..i] {
            if !conditions_shadow(earlier, later) {
                continue;
            }
            match earlier.path_or_default() {
                PathMatcher::Prefix(prefix) => {
                    if later_path.starts_with(&prefix) && earlier != later {
                        reports.add_warning(
                            ResourceKind::VirtualService,
                            vs,
                            format!(
                                "virtual host [{}] has unordered prefix routes, earlier prefix [{}] \
                                 short-circuited later route [{:?}]",
                                virtual_host.name, prefix, later
                            ),
                        );
                    }
                }
                PathMatcher::Regex(pattern) => {
                    if matches!(later.path, Some(PathMatcher::Regex(_))) {
                        continue;
                    }
                    let Ok(re) = Regex::new(&pattern) else {
                        continue;
                    };
                    if re.is_match(&later_path) {
                        reports.add_warning(
                            ResourceKind::VirtualService,
                            vs,
                            format!(
                                "virtual host [{}] has unordered regex routes, earlier regex [{}] \
                                 short-circuited later route [{:?}]",
                                virtual_host.name, pattern, later
                            ),
                        );
                    }
                }
                PathMatcher::Exact(_) => {}
            }
        }
    }
}

fn path_string(matcher: &Matcher) -> String {
    match matcher.path_or_default() {
        PathMatcher::Prefix(p) | PathMatcher::Exact(p) | PathMatcher::Regex(p) => p,
    }
}

/// Every non-path condition of `earlier` also constrains `later`, so any
/// request `later` accepts is also accepted by `earlier`
fn conditions_shadow(earlier: &Matcher, later: &Matcher) -> bool {
    let headers = earlier.headers.iter().all(|h| later.headers.contains(h));
    let params = earlier
        .query_parameters
        .iter()
        .all(|q| later.query_parameters.contains(q));
    let methods = earlier.methods.is_empty()
        || (!later.methods.is_empty() && later.methods.iter().all(|m| earlier.methods.contains(m)));
    headers && params && methods
}
