use super::core::{HasStatus, ResourceRef, Status};
use super::options::{HttpListenerOptions, ListenerOptions, RouteOptions, SslConfig, VirtualHostOptions};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Proxy is the full listener set one data-plane instance serves
///
/// Proxies are normally generated from Gateways and VirtualServices, but may
/// also be written directly.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.edge.dev",
    version = "v1",
    kind = "Proxy",
    plural = "proxies",
    namespaced,
    derive = "Default",
    status = "Status",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default)]
    pub listeners: Vec<Listener>,
}

impl HasStatus for Proxy {
    fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: Status) {
        self.status = Some(status);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    pub bind_port: u16,

    pub listener_type: ListenerType,

    /// One TLS filter chain per entry; empty means plaintext
    #[serde(default)]
    pub ssl_configurations: Vec<SslConfig>,

    #[serde(default)]
    pub options: ListenerOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ListenerType {
    Http(HttpListener),
    Tcp(TcpListener),
    Hybrid(HybridListener),
}

impl Default for ListenerType {
    fn default() -> Self {
        ListenerType::Http(HttpListener::default())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpListener {
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHost>,

    #[serde(default)]
    pub options: HttpListenerOptions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    pub name: String,

    /// Empty matches any host
    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub options: VirtualHostOptions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Any matcher may match; empty matches every request
    #[serde(default)]
    pub matchers: Vec<Matcher>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    #[serde(default)]
    pub options: RouteOptions,
}

/// Request match conditions
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    /// Defaults to prefix `/`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatcher>,

    #[serde(default)]
    pub headers: Vec<HeaderMatcher>,

    #[serde(default)]
    pub query_parameters: Vec<QueryParameterMatcher>,

    /// HTTP methods (GET, POST, etc)
    #[serde(default)]
    pub methods: Vec<String>,
}

impl Matcher {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            path: Some(PathMatcher::Prefix(prefix.into())),
            ..Default::default()
        }
    }

    pub fn exact(path: impl Into<String>) -> Self {
        Self {
            path: Some(PathMatcher::Exact(path.into())),
            ..Default::default()
        }
    }

    pub fn regex(regex: impl Into<String>) -> Self {
        Self {
            path: Some(PathMatcher::Regex(regex.into())),
            ..Default::default()
        }
    }

    pub fn path_or_default(&self) -> PathMatcher {
        self.path.clone().unwrap_or_else(|| PathMatcher::Prefix("/".to_string()))
    }

    /// Matches on nothing but the path
    pub fn is_path_only(&self) -> bool {
        self.headers.is_empty() && self.query_parameters.is_empty() && self.methods.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PathMatcher {
    Prefix(String),
    Exact(String),
    Regex(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatcher {
    pub name: String,

    /// Absent means "header is present"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default)]
    pub regex: bool,

    #[serde(default)]
    pub invert_match: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameterMatcher {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default)]
    pub regex: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Route(RouteAction),
    Redirect(RedirectAction),
    DirectResponse(DirectResponseAction),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum RouteAction {
    Single(Destination),
    Multi(Vec<WeightedDestination>),
    /// Forward to the host named by the request's Host header
    DynamicForwardProxy,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub upstream: ResourceRef,
}

impl Destination {
    pub fn upstream(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            upstream: ResourceRef::new(namespace, name),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WeightedDestination {
    pub destination: Destination,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedirectAction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_redirect: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_redirect: Option<String>,

    #[serde(default)]
    pub https_redirect: bool,

    #[serde(default = "default_redirect_code")]
    pub response_code: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectResponseAction {
    pub status: u16,

    #[serde(default)]
    pub body: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TcpListener {
    #[serde(default)]
    pub tcp_hosts: Vec<TcpHost>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TcpHost {
    pub name: String,

    pub destination: Destination,

    /// Filter chain matched by SNI when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_config: Option<SslConfig>,
}

/// Listener that picks an HTTP or TCP filter chain by source address
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HybridListener {
    #[serde(default)]
    pub matched_listeners: Vec<MatchedListener>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchedListener {
    #[serde(default)]
    pub matcher: HybridMatcher,

    pub listener: MatchedListenerType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HybridMatcher {
    /// CIDR ranges, e.g. "10.0.0.0/8"
    #[serde(default)]
    pub source_prefix_ranges: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_config: Option<SslConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum MatchedListenerType {
    Http(HttpListener),
    Tcp(TcpListener),
}

fn default_bind_address() -> String {
    "::".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_redirect_code() -> u16 {
    301
}
