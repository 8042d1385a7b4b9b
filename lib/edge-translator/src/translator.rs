//! Proxy translator
//!
//! Compiles a Proxy and the upstreams it routes to into a [`Snapshot`].
//! Problems are reported, never returned: a listener or route with errors
//! rejects the Proxy while the rest of the configuration is still built.

use crate::plugins::ext_auth::route_auth;
use crate::plugins::tls::downstream_tls;
use crate::plugins::{Params, PluginRegistry};
use crate::policy::effective_policies;
use crate::reporter::{ProxyReporter, ProxySources};
use crate::validation::{route_errors, validate_proxy};
use edge_api::v1::options::{HttpListenerOptions, Locality, SslConfig};
use edge_api::v1::proxy::{
    Action, DirectResponseAction, HttpListener, Listener, ListenerType, MatchedListenerType, Matcher, RouteAction,
    TcpListener, VirtualHost,
};
use edge_api::xds::{
    self, cluster_name, Cluster, ClusterKind, ClusterLoadAssignment, EnvoyAction, EnvoyRoute, EnvoyVirtualHost,
    FilterChain, FilterChainMatch, FilterStage, HttpConnectionManager, HttpFilter, LbEndpoint, LocalityLbEndpoints,
    NetworkFilter, RouteConfiguration, Snapshot, TcpProxy, WeightedCluster,
};
use edge_api::{Proxy, ResourceRef, Upstream};
use edge_core::settings::GatewaySettings;
use edge_core::{ApiSnapshot, Endpoint, ResourceKind, ResourceReports};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Cluster serving routes that forward to the request authority
pub const DYNAMIC_FORWARD_PROXY_CLUSTER: &str = "dynamic_forward_proxy";
/// Terminal HTTP filter, always last
pub const ROUTER_FILTER: &str = "router";

const INVALID_ROUTE_BODY: &str = "route has invalid configuration";

#[derive(Clone, Debug, PartialEq)]
pub struct TranslatorOptions {
    /// Serve a direct response for routes with errors instead of rejecting the proxy
    pub replace_invalid_routes: bool,
    pub invalid_route_response_code: u16,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            replace_invalid_routes: false,
            invalid_route_response_code: 404,
        }
    }
}

impl From<&GatewaySettings> for TranslatorOptions {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            replace_invalid_routes: settings.replace_invalid_routes,
            invalid_route_response_code: settings.invalid_route_response_code,
        }
    }
}

/// Clusters and load assignments of every upstream without errors
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpstreamTranslation {
    pub clusters: Vec<Cluster>,
    pub assignments: Vec<ClusterLoadAssignment>,
}

impl UpstreamTranslation {
    pub fn has_cluster(&self, name: &str) -> bool {
        self.clusters.iter().any(|c| c.name == name)
    }
}

pub struct ProxyTranslator {
    options: TranslatorOptions,
    plugins: PluginRegistry,
}

/// State accumulated while translating one proxy
struct ProxyContext<'a> {
    params: &'a Params<'a>,
    namespace: String,
    upstreams: &'a UpstreamTranslation,
    route_configurations: Vec<RouteConfiguration>,
    needs_forward_proxy: bool,
}

impl ProxyTranslator {
    pub fn new(options: TranslatorOptions) -> Self {
        Self::with_plugins(options, PluginRegistry::default())
    }

    pub fn with_plugins(options: TranslatorOptions, plugins: PluginRegistry) -> Self {
        Self { options, plugins }
    }

    pub fn options(&self) -> &TranslatorOptions {
        &self.options
    }

    /// Translate a single proxy together with every upstream in the snapshot
    pub fn translate(
        &self,
        snapshot: &ApiSnapshot,
        endpoints: &HashMap<String, Vec<Endpoint>>,
        proxy: &Proxy,
        sources: Option<&ProxySources>,
        reports: &mut ResourceReports,
    ) -> Snapshot {
        let params = Params::new(snapshot, endpoints);
        let upstreams = self.translate_upstreams(&params, reports);
        self.translate_proxy(&params, proxy, &upstreams, sources, reports)
    }

    /// Build the cluster and load assignment of every upstream
    ///
    /// Upstreams with errors are reported and left out.
    pub fn translate_upstreams(&self, params: &Params<'_>, reports: &mut ResourceReports) -> UpstreamTranslation {
        let mut out = UpstreamTranslation::default();

        for upstream in &params.snapshot.upstreams {
            let reference = ResourceRef::of(upstream);
            reports.accept(ResourceKind::Upstream, &reference);
            let name = cluster_name(&reference);

            let mut cluster = Cluster {
                name: name.clone(),
                ..Default::default()
            };
            for plugin in &self.plugins.upstream {
                if let Err(e) = plugin.process_upstream(params, upstream, &mut cluster) {
                    debug!(upstream = %reference, plugin = plugin.name(), error = %e, "Upstream plugin failed");
                    reports.add_error(ResourceKind::Upstream, &reference, e.to_string());
                }
            }

            let mut assignment = base_assignment(&name, upstream, params.endpoints.get(&reference.key()));
            for plugin in &self.plugins.endpoint {
                if let Err(e) = plugin.process_endpoints(params, upstream, &mut assignment) {
                    debug!(upstream = %reference, plugin = plugin.name(), error = %e, "Endpoint plugin failed");
                    reports.add_error(ResourceKind::Upstream, &reference, e.to_string());
                }
            }

            if reports.has_errors(ResourceKind::Upstream, &reference) {
                continue;
            }
            out.clusters.push(cluster);
            out.assignments.push(assignment);
        }
        out
    }

    pub fn translate_proxy(
        &self,
        params: &Params<'_>,
        proxy: &Proxy,
        upstreams: &UpstreamTranslation,
        sources: Option<&ProxySources>,
        reports: &mut ResourceReports,
    ) -> Snapshot {
        let mut reporter = ProxyReporter::new(ResourceRef::of(proxy), reports, sources);
        validate_proxy(proxy, &mut reporter);

        let mut ctx = ProxyContext {
            params,
            namespace: proxy.namespace().unwrap_or_default(),
            upstreams,
            route_configurations: Vec::new(),
            needs_forward_proxy: false,
        };
        let listeners: Vec<xds::Listener> = proxy
            .spec
            .listeners
            .iter()
            .map(|listener| self.translate_listener(&mut ctx, listener, &mut reporter))
            .collect();

        let mut clusters = upstreams.clusters.clone();
        if ctx.needs_forward_proxy {
            clusters.push(Cluster {
                name: DYNAMIC_FORWARD_PROXY_CLUSTER.to_string(),
                kind: ClusterKind::DynamicForwardProxy,
                ..Default::default()
            });
        }

        let snapshot = Snapshot::new(
            listeners,
            ctx.route_configurations,
            clusters,
            upstreams.assignments.clone(),
        );
        debug!(
            proxy = %reporter.proxy(),
            version = %snapshot.version,
            rejected = reporter.has_errors(),
            "Translated proxy"
        );
        snapshot
    }

    fn translate_listener(
        &self,
        ctx: &mut ProxyContext<'_>,
        listener: &Listener,
        reporter: &mut ProxyReporter<'_>,
    ) -> xds::Listener {
        let mut out = xds::Listener {
            name: listener.name.clone(),
            address: listener.bind_address.clone(),
            port: listener.bind_port,
            ..Default::default()
        };
        for plugin in &self.plugins.listener {
            if let Err(e) = plugin.process_listener(ctx.params, listener, &mut out) {
                reporter.listener_error(&listener.name, format!("listener {}: {}", listener.name, e));
            }
        }

        out.filter_chains = match &listener.listener_type {
            ListenerType::Http(http) => {
                let route_config = format!("{}-routes", listener.name);
                let hcm = self.http_connection_manager(ctx, &listener.name, http, route_config, reporter);
                self.filter_chains(
                    ctx,
                    &listener.name,
                    &listener.name,
                    &listener.ssl_configurations,
                    &[],
                    NetworkFilter::HttpConnectionManager(hcm),
                    reporter,
                )
            }
            ListenerType::Tcp(tcp) => self.tcp_chains(ctx, &listener.name, &listener.name, tcp, &[], reporter),
            ListenerType::Hybrid(hybrid) => {
                let mut chains = Vec::new();
                for (i, matched) in hybrid.matched_listeners.iter().enumerate() {
                    let chain_name = format!("{}-{}", listener.name, i);
                    let ranges = &matched.matcher.source_prefix_ranges;
                    match &matched.listener {
                        MatchedListenerType::Http(http) => {
                            let route_config = format!("{}-routes-{}", listener.name, i);
                            let hcm =
                                self.http_connection_manager(ctx, &listener.name, http, route_config, reporter);
                            let ssl: Vec<SslConfig> = matched.matcher.ssl_config.iter().cloned().collect();
                            chains.extend(self.filter_chains(
                                ctx,
                                &listener.name,
                                &chain_name,
                                &ssl,
                                ranges,
                                NetworkFilter::HttpConnectionManager(hcm),
                                reporter,
                            ));
                        }
                        MatchedListenerType::Tcp(tcp) => {
                            chains.extend(self.tcp_chains(ctx, &listener.name, &chain_name, tcp, ranges, reporter))
                        }
                    }
                }
                chains
            }
        };
        out
    }

    /// One plaintext chain, or one TLS chain per SSL configuration
    #[allow(clippy::too_many_arguments)]
    fn filter_chains(
        &self,
        ctx: &ProxyContext<'_>,
        listener: &str,
        chain_name: &str,
        ssl_configurations: &[SslConfig],
        source_prefix_ranges: &[String],
        filter: NetworkFilter,
        reporter: &mut ProxyReporter<'_>,
    ) -> Vec<FilterChain> {
        if ssl_configurations.is_empty() {
            return vec![FilterChain {
                name: chain_name.to_string(),
                filter_chain_match: FilterChainMatch {
                    source_prefix_ranges: source_prefix_ranges.to_vec(),
                    server_names: Vec::new(),
                },
                tls: None,
                filter,
            }];
        }

        let mut chains = Vec::with_capacity(ssl_configurations.len());
        for (i, ssl) in ssl_configurations.iter().enumerate() {
            match downstream_tls(ctx.params.snapshot, ssl, &ctx.namespace) {
                Ok(tls) => chains.push(FilterChain {
                    name: format!("{}-ssl-{}", chain_name, i),
                    filter_chain_match: FilterChainMatch {
                        source_prefix_ranges: source_prefix_ranges.to_vec(),
                        server_names: ssl.sni_domains.clone(),
                    },
                    tls: Some(tls),
                    filter: filter.clone(),
                }),
                Err(e) => reporter.listener_error(listener, format!("listener {}: {}", listener, e)),
            }
        }
        chains
    }

    fn tcp_chains(
        &self,
        ctx: &ProxyContext<'_>,
        listener: &str,
        chain_name: &str,
        tcp: &TcpListener,
        source_prefix_ranges: &[String],
        reporter: &mut ProxyReporter<'_>,
    ) -> Vec<FilterChain> {
        let mut chains = Vec::new();
        for host in &tcp.tcp_hosts {
            let upstream = host.destination.upstream.in_namespace(&ctx.namespace);
            if ctx.params.snapshot.upstream(&upstream).is_none() {
                reporter.listener_error(
                    listener,
                    format!("tcp host {} of listener {}: upstream {} not found", host.name, listener, upstream),
                );
                continue;
            }
            let filter = NetworkFilter::TcpProxy(TcpProxy {
                stat_prefix: tcp.stat_prefix.clone().unwrap_or_else(|| listener.to_string()),
                cluster: cluster_name(&upstream),
            });
            let ssl: Vec<SslConfig> = host.ssl_config.iter().cloned().collect();
            chains.extend(self.filter_chains(
                ctx,
                listener,
                &format!("{}-{}", chain_name, host.name),
                &ssl,
                source_prefix_ranges,
                filter,
                reporter,
            ));
        }
        chains
    }

    fn http_connection_manager(
        &self,
        ctx: &mut ProxyContext<'_>,
        listener: &str,
        http: &HttpListener,
        route_config_name: String,
        reporter: &mut ProxyReporter<'_>,
    ) -> HttpConnectionManager {
        let mut hcm = HttpConnectionManager {
            route_config_name: route_config_name.clone(),
            server_name: http.options.server_name.clone(),
            ..Default::default()
        };
        for plugin in &self.plugins.http {
            if let Err(e) = plugin.process_hcm(ctx.params, http, &mut hcm) {
                reporter.listener_error(listener, format!("listener {}: {}", listener, e));
            }
        }
        hcm.http_filters.sort_by_key(|f| f.stage);
        hcm.http_filters.push(HttpFilter {
            name: ROUTER_FILTER.to_string(),
            stage: FilterStage::Route,
        });

        let virtual_hosts = http
            .virtual_hosts
            .iter()
            .map(|vh| self.translate_virtual_host(ctx, listener, &http.options, vh, reporter))
            .collect();
        ctx.route_configurations.push(RouteConfiguration {
            name: route_config_name,
            virtual_hosts,
        });
        hcm
    }

    fn translate_virtual_host(
        &self,
        ctx: &mut ProxyContext<'_>,
        listener: &str,
        listener_options: &HttpListenerOptions,
        vh: &VirtualHost,
        reporter: &mut ProxyReporter<'_>,
    ) -> EnvoyVirtualHost {
        let mut routes = Vec::new();

        for (i, route) in vh.routes.iter().enumerate() {
            let base_name = route
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-route-{}", vh.name, i));
            let mut errors = route_errors(route, ctx.params.snapshot, &ctx.namespace);
            let ext_auth = route_auth(ctx.params.snapshot, &vh.options, &route.options, &ctx.namespace)
                .unwrap_or_else(|e| {
                    errors.push(e);
                    None
                });

            let action = match &route.action {
                Some(action) if errors.is_empty() => self.envoy_action(ctx, action, &vh.name, reporter),
                _ if self.options.replace_invalid_routes => {
                    let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                    reporter.virtual_host_warning(
                        &vh.name,
                        format!(
                            "route {} of virtual host {} replaced with a direct response: {}",
                            base_name,
                            vh.name,
                            reasons.join(", ")
                        ),
                    );
                    EnvoyAction::DirectResponse(DirectResponseAction {
                        status: self.options.invalid_route_response_code,
                        body: INVALID_ROUTE_BODY.to_string(),
                    })
                }
                _ => {
                    for e in errors {
                        reporter.virtual_host_error(
                            listener,
                            &vh.name,
                            format!("route {} of virtual host {}: {}", base_name, vh.name, e),
                        );
                    }
                    continue;
                }
            };

            let mut policies = effective_policies(listener_options, &vh.options, &route.options);
            policies.ext_auth = ext_auth;
            let matchers = if route.matchers.is_empty() {
                vec![Matcher::default()]
            } else {
                route.matchers.clone()
            };
            let multiple = matchers.len() > 1;
            for (j, matcher) in matchers.into_iter().enumerate() {
                routes.push(EnvoyRoute {
                    name: if multiple {
                        format!("{}-{}", base_name, j)
                    } else {
                        base_name.clone()
                    },
                    matcher,
                    action: action.clone(),
                    policies: policies.clone(),
                });
            }
        }

        EnvoyVirtualHost {
            name: vh.name.clone(),
            domains: if vh.domains.is_empty() {
                vec!["*".to_string()]
            } else {
                vh.domains.clone()
            },
            routes,
        }
    }

    fn envoy_action(
        &self,
        ctx: &mut ProxyContext<'_>,
        action: &Action,
        virtual_host: &str,
        reporter: &mut ProxyReporter<'_>,
    ) -> EnvoyAction {
        let namespace = ctx.namespace.clone();
        let translated = ctx.upstreams;
        let cluster_for = |upstream: &ResourceRef, reporter: &mut ProxyReporter<'_>| {
            let upstream = upstream.in_namespace(&namespace);
            let name = cluster_name(&upstream);
            if !translated.has_cluster(&name) {
                reporter.virtual_host_warning(
                    virtual_host,
                    format!("upstream {} has errors and receives no traffic", upstream),
                );
            }
            name
        };

        match action {
            Action::Route(RouteAction::Single(dest)) => EnvoyAction::Cluster(cluster_for(&dest.upstream, reporter)),
            Action::Route(RouteAction::Multi(dests)) => EnvoyAction::WeightedClusters(
                dests
                    .iter()
                    .map(|d| WeightedCluster {
                        name: cluster_for(&d.destination.upstream, reporter),
                        weight: d.weight,
                    })
                    .collect(),
            ),
            Action::Route(RouteAction::DynamicForwardProxy) => {
                ctx.needs_forward_proxy = true;
                EnvoyAction::Cluster(DYNAMIC_FORWARD_PROXY_CLUSTER.to_string())
            }
            Action::Redirect(redirect) => EnvoyAction::Redirect(redirect.clone()),
            Action::DirectResponse(direct) => EnvoyAction::DirectResponse(direct.clone()),
        }
    }
}

/// Static hosts and discovered endpoints at priority 0, grouped by locality
fn base_assignment(name: &str, upstream: &Upstream, discovered: Option<&Vec<Endpoint>>) -> ClusterLoadAssignment {
    let mut by_locality: BTreeMap<Locality, Vec<LbEndpoint>> = BTreeMap::new();

    for host in &upstream.spec.static_hosts {
        by_locality.entry(Locality::default()).or_default().push(LbEndpoint {
            address: host.addr.clone(),
            port: host.port,
            weight: host.load_balancing_weight.unwrap_or(1),
            health_check_path: host.health_check_path.clone(),
            tls: None,
        });
    }
    for ep in discovered.into_iter().flatten().filter(|ep| ep.ready) {
        by_locality
            .entry(ep.locality.clone())
            .or_default()
            .push(LbEndpoint::new(ep.address.clone(), ep.port));
    }

    ClusterLoadAssignment {
        cluster_name: name.to_string(),
        endpoints: by_locality
            .into_iter()
            .map(|(locality, lb_endpoints)| LocalityLbEndpoints {
                locality,
                priority: 0,
                load_balancing_weight: None,
                lb_endpoints,
            })
            .collect(),
    }
}
