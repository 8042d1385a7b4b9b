//! Listener runtime
//!
//! A [`ListenerState`] is built from one listener of a snapshot and swapped
//! in place through a watch channel, so connections already accepted keep
//! the state they started with. Each connection picks one filter chain by
//! SNI and source address, then is served as HTTP or piped as TCP.

use crate::cluster::ClusterManager;
use crate::error::ProxyError;
use crate::ext_auth::Authenticator;
use crate::forwarder::RequestForwarder;
use crate::http::HttpProxy;
use crate::metrics::MetricsCollector;
use crate::proxy_protocol::read_proxy_header;
use crate::rate_limit::RateLimiter;
use crate::tcp::TcpProxy;
use crate::tls;
use crate::Result;
use edge_api::xds::{Listener, NetworkFilter, Snapshot};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use ipnetwork::IpNetwork;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub const PROXY_PROTOCOL_FILTER: &str = "proxy_protocol";

const TLS_HANDSHAKE: u8 = 0x16;
const MAX_CLIENT_HELLO: usize = 16 * 1024 + 5;
const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every listener of one proxy
#[derive(Clone)]
pub struct SharedRuntime {
    pub clusters: Arc<ClusterManager>,
    pub forwarder: Arc<RequestForwarder>,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticator: Arc<Authenticator>,
    pub metrics: Option<MetricsCollector>,
    /// Access-log service used by streaming sinks that name no endpoint
    pub access_log_endpoint: Option<String>,
}

impl SharedRuntime {
    pub fn new(metrics: Option<MetricsCollector>, access_log_endpoint: Option<String>) -> Self {
        Self {
            clusters: Arc::new(ClusterManager::new(metrics.clone())),
            forwarder: Arc::new(RequestForwarder::new(metrics.clone())),
            rate_limiter: Arc::new(RateLimiter::new()),
            authenticator: Arc::new(Authenticator::new()),
            metrics,
            access_log_endpoint,
        }
    }
}

#[derive(Clone)]
pub enum ChainHandler {
    Http(Arc<HttpProxy>),
    Tcp(Arc<TcpProxy>),
}

pub struct ChainRuntime {
    pub name: String,
    source_ranges: Vec<IpNetwork>,
    server_names: Vec<String>,
    tls: Option<Arc<ServerConfig>>,
    pub handler: ChainHandler,
}

impl ChainRuntime {
    /// Match rank, or `None` when the chain does not apply
    fn rank(&self, source: IpAddr, sni: Option<&str>) -> Option<(u8, u8)> {
        let sni_rank = if self.server_names.is_empty() {
            0
        } else {
            let sni = sni?.to_ascii_lowercase();
            self.server_names
                .iter()
                .filter_map(|name| match_server_name(name, &sni))
                .max()?
        };
        let source_rank = if self.source_ranges.is_empty() {
            0
        } else {
            self.source_ranges
                .iter()
                .filter(|range| range.contains(source))
                .map(|range| range.prefix() + 1)
                .max()?
        };
        Some((sni_rank, source_rank))
    }

    pub fn terminates_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// 2 for an exact name, 1 for a `*.` wildcard
fn match_server_name(name: &str, sni: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name == sni {
        return Some(2);
    }
    match name.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') && sni.ends_with(suffix) && sni.len() > suffix.len() => {
            Some(1)
        }
        _ => None,
    }
}

/// Everything needed to serve connections of one listener
pub struct ListenerState {
    pub name: String,
    pub version: String,
    /// `Some(optional)` when a PROXY header is read first
    proxy_protocol: Option<bool>,
    chains: Vec<ChainRuntime>,
}

impl ListenerState {
    pub fn build(listener: &Listener, snapshot: &Snapshot, runtime: &SharedRuntime) -> Result<Self> {
        let mut chains = Vec::with_capacity(listener.filter_chains.len());
        for (i, chain) in listener.filter_chains.iter().enumerate() {
            let name = if chain.name.is_empty() {
                format!("{}-{}", listener.name, i)
            } else {
                chain.name.clone()
            };
            let source_ranges = chain
                .filter_chain_match
                .source_prefix_ranges
                .iter()
                .map(|range| {
                    range.parse::<IpNetwork>().map_err(|e| {
                        ProxyError::InvalidConfiguration(format!("{}: source range {}: {}", name, range, e))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let tls = chain.tls.as_ref().map(tls::server_config).transpose()?;

            let handler = match &chain.filter {
                NetworkFilter::HttpConnectionManager(manager) => {
                    let route_config = snapshot
                        .route_configuration(&manager.route_config_name)
                        .ok_or_else(|| {
                            ProxyError::InvalidConfiguration(format!(
                                "{}: route configuration {} not found",
                                name, manager.route_config_name
                            ))
                        })?;
                    ChainHandler::Http(Arc::new(HttpProxy::new(
                        &listener.name,
                        manager,
                        route_config,
                        &listener.access_logs,
                        tls.is_some(),
                        runtime.clone(),
                    )?))
                }
                NetworkFilter::TcpProxy(tcp) => ChainHandler::Tcp(Arc::new(TcpProxy::new(
                    tcp.clone(),
                    runtime.clusters.clone(),
                    runtime.metrics.clone(),
                ))),
            };

            chains.push(ChainRuntime {
                name,
                source_ranges,
                server_names: chain.filter_chain_match.server_names.clone(),
                tls,
                handler,
            });
        }

        Ok(Self {
            name: listener.name.clone(),
            version: snapshot.version.clone(),
            proxy_protocol: listener
                .has_listener_filter(PROXY_PROTOCOL_FILTER)
                .then_some(listener.proxy_protocol_optional),
            chains,
        })
    }

    fn needs_sniff(&self) -> bool {
        self.chains
            .iter()
            .any(|c| c.terminates_tls() || !c.server_names.is_empty())
    }

    pub fn chains(&self) -> &[ChainRuntime] {
        &self.chains
    }

    /// Most specific chain: server name first, then source prefix length.
    /// Plaintext connections only see chains that do not terminate TLS.
    pub fn select_chain(&self, source: IpAddr, sni: Option<&str>, is_tls: bool) -> Option<&ChainRuntime> {
        let mut best: Option<((u8, u8), &ChainRuntime)> = None;
        for chain in &self.chains {
            if chain.terminates_tls() && !is_tls {
                continue;
            }
            if let Some(rank) = chain.rank(source, sni) {
                if best.map_or(true, |(current, _)| rank > current) {
                    best = Some((rank, chain));
                }
            }
        }
        best.map(|(_, chain)| chain)
    }

    async fn serve_connection(&self, mut stream: TcpStream, mut remote: SocketAddr) -> Result<()> {
        if let Some(optional) = self.proxy_protocol {
            let header = tokio::time::timeout(SNIFF_TIMEOUT, read_proxy_header(&mut stream, optional))
                .await
                .map_err(|_| ProxyError::ProxyProtocol("timed out reading header".into()))??;
            if let Some(source) = header.and_then(|h| h.source) {
                remote = source;
            }
        }

        // server-first TCP protocols send nothing until the upstream speaks
        let (is_tls, sni) = if self.needs_sniff() {
            tokio::time::timeout(SNIFF_TIMEOUT, sniff(&stream))
                .await
                .map_err(|_| ProxyError::Connection("timed out waiting for client data".into()))??
        } else {
            (false, None)
        };
        let Some(chain) = self.select_chain(remote.ip(), sni.as_deref(), is_tls) else {
            debug!(listener = %self.name, remote = %remote, sni = ?sni, "No filter chain matched");
            return Ok(());
        };
        debug!(listener = %self.name, chain = %chain.name, remote = %remote, "Selected filter chain");

        match &chain.tls {
            Some(config) => {
                let stream = TlsAcceptor::from(config.clone())
                    .accept(stream)
                    .await
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                dispatch(chain.handler.clone(), stream, remote).await
            }
            None => dispatch(chain.handler.clone(), stream, remote).await,
        }
    }
}

async fn dispatch<S>(handler: ChainHandler, stream: S, remote: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match handler {
        ChainHandler::Http(proxy) => {
            let service = service_fn(move |req: Request<Incoming>| {
                let proxy = proxy.clone();
                async move { Ok::<_, Infallible>(proxy.handle(req, remote).await) }
            });
            auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
                .map_err(|e| ProxyError::Connection(e.to_string()))
        }
        ChainHandler::Tcp(proxy) => proxy.handle(stream, remote).await.map(|_| ()),
    }
}

/// Whether the connection starts with a TLS handshake and, if so, its SNI.
/// Nothing is consumed from the stream.
async fn sniff(stream: &TcpStream) -> Result<(bool, Option<String>)> {
    let mut buf = vec![0u8; MAX_CLIENT_HELLO];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok((false, None));
        }
        if buf[0] != TLS_HANDSHAKE {
            return Ok((false, None));
        }
        if n == seen {
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        }
        seen = n;
        match client_hello_sni(&buf[..n]) {
            ClientHello::Incomplete if n < MAX_CLIENT_HELLO => continue,
            ClientHello::Incomplete | ClientHello::Invalid => return Ok((true, None)),
            ClientHello::Complete(sni) => return Ok((true, sni)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ClientHello {
    Incomplete,
    Invalid,
    Complete(Option<String>),
}

/// SNI of the ClientHello in the first TLS record of `buf`
fn client_hello_sni(buf: &[u8]) -> ClientHello {
    if buf.len() < 5 {
        return ClientHello::Incomplete;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return ClientHello::Incomplete;
    }
    match parse_client_hello(&buf[5..5 + record_len]) {
        Some(sni) => ClientHello::Complete(sni),
        None => ClientHello::Invalid,
    }
}

fn parse_client_hello(hello: &[u8]) -> Option<Option<String>> {
    let mut r = Reader(hello);
    if r.u8()? != 0x01 {
        return None;
    }
    r.skip(3)?; // handshake length
    r.skip(2 + 32)?; // version, random
    let session = r.u8()? as usize;
    r.skip(session)?;
    let suites = r.u16()? as usize;
    r.skip(suites)?;
    let compression = r.u8()? as usize;
    r.skip(compression)?;
    if r.0.is_empty() {
        return Some(None);
    }
    let len = r.u16()? as usize;
    let mut extensions = Reader(r.take(len)?);
    while !extensions.0.is_empty() {
        let kind = extensions.u16()?;
        let len = extensions.u16()? as usize;
        let data = extensions.take(len)?;
        if kind != 0x0000 {
            continue;
        }
        let mut list = Reader(data);
        let len = list.u16()? as usize;
        let mut names = Reader(list.take(len)?);
        while !names.0.is_empty() {
            let name_type = names.u8()?;
            let len = names.u16()? as usize;
            let name = names.take(len)?;
            if name_type == 0 {
                return Some(std::str::from_utf8(name).ok().map(|s| s.to_ascii_lowercase()));
            }
        }
    }
    Some(None)
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Some(head)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

/// Accept connections until `shutdown` flips to true. Each connection is
/// served with the state current when it was accepted.
pub async fn serve(
    listener: TcpListener,
    state: watch::Receiver<Arc<ListenerState>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!(listener = %state.borrow().name, address = %local, "Listener started");

    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(address = %local, error = %e, "Failed to accept connection");
                    continue;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let current = state.borrow().clone();
        tokio::spawn(async move {
            if let Err(e) = current.serve_connection(stream, remote).await {
                debug!(listener = %current.name, remote = %remote, error = %e, "Connection closed with error");
            }
        });
    }

    info!(address = %local, "Listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::proxy::{DirectResponseAction, Matcher};
    use edge_api::xds::{
        EnvoyAction, EnvoyRoute, EnvoyVirtualHost, FilterChain, FilterChainMatch,
        HttpConnectionManager, RouteConfiguration, RoutePolicies,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn tcp_chain(name: &str, ranges: &[&str], server_names: &[&str]) -> FilterChain {
        FilterChain {
            name: name.into(),
            filter_chain_match: FilterChainMatch {
                source_prefix_ranges: ranges.iter().map(|r| r.to_string()).collect(),
                server_names: server_names.iter().map(|s| s.to_string()).collect(),
            },
            tls: None,
            filter: NetworkFilter::TcpProxy(edge_api::xds::TcpProxy {
                stat_prefix: name.into(),
                cluster: format!("{}_default", name),
            }),
        }
    }

    fn http_snapshot(body: &str) -> (Listener, Snapshot) {
        let listener = Listener {
            name: "listener-::-8080".into(),
            address: "127.0.0.1".into(),
            port: 0,
            listener_filters: vec![PROXY_PROTOCOL_FILTER.into()],
            proxy_protocol_optional: true,
            filter_chains: vec![FilterChain {
                name: "http".into(),
                filter: NetworkFilter::HttpConnectionManager(HttpConnectionManager {
                    route_config_name: "listener-::-8080-routes".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let snapshot = Snapshot {
            version: "v1".into(),
            route_configurations: vec![RouteConfiguration {
                name: "listener-::-8080-routes".into(),
                virtual_hosts: vec![EnvoyVirtualHost {
                    name: "default.petstore".into(),
                    domains: vec!["*".into()],
                    routes: vec![EnvoyRoute {
                        name: "hello".into(),
                        matcher: Matcher::prefix("/"),
                        action: EnvoyAction::DirectResponse(DirectResponseAction {
                            status: 200,
                            body: body.into(),
                        }),
                        policies: RoutePolicies::default(),
                    }],
                }],
            }],
            listeners: vec![listener.clone()],
            ..Default::default()
        };
        (listener, snapshot)
    }

    fn client_hello(sni: &str) -> Vec<u8> {
        let mut server_name = vec![0u8];
        server_name.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        server_name.extend_from_slice(sni.as_bytes());
        let mut list = (server_name.len() as u16).to_be_bytes().to_vec();
        list.extend_from_slice(&server_name);
        let mut extensions = vec![0x00, 0x00];
        extensions.extend_from_slice(&(list.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&list);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_client_hello_sni() {
        let hello = client_hello("API.example.com");
        assert_eq!(
            client_hello_sni(&hello),
            ClientHello::Complete(Some("api.example.com".into()))
        );
        assert_eq!(client_hello_sni(&hello[..20]), ClientHello::Incomplete);

        let mut garbage = hello.clone();
        garbage[5] = 0x02;
        assert_eq!(client_hello_sni(&garbage), ClientHello::Invalid);
    }

    #[test]
    fn test_client_hello_lengths_bounded() {
        // server name length claims more bytes than the extension holds
        let mut hello = client_hello("api.example.com");
        hello[59] = 0xff;
        hello[60] = 0xff;
        assert_eq!(client_hello_sni(&hello), ClientHello::Invalid);

        // extensions block cut short
        let mut hello = client_hello("api.example.com");
        hello[50] = 0x00;
        hello[51] = 0x02;
        assert_eq!(client_hello_sni(&hello), ClientHello::Invalid);
    }

    #[test]
    fn test_select_chain() {
        let listener = Listener {
            name: "tcp".into(),
            filter_chains: vec![
                tcp_chain("any", &[], &[]),
                tcp_chain("internal", &["10.0.0.0/8"], &[]),
                tcp_chain("office", &["10.1.0.0/16"], &[]),
                tcp_chain("wildcard", &[], &["*.example.com"]),
                tcp_chain("exact", &[], &["db.example.com"]),
            ],
            ..Default::default()
        };
        let runtime = SharedRuntime::new(None, None);
        let state = ListenerState::build(&listener, &Snapshot::default(), &runtime).unwrap();
        let select = |ip: &str, sni: Option<&str>| {
            state
                .select_chain(ip.parse().unwrap(), sni, sni.is_some())
                .map(|c| c.name.clone())
        };

        assert_eq!(select("192.168.0.1", None).as_deref(), Some("any"));
        assert_eq!(select("10.2.0.1", None).as_deref(), Some("internal"));
        assert_eq!(select("10.1.0.1", None).as_deref(), Some("office"));
        assert_eq!(select("10.1.0.1", Some("web.example.com")).as_deref(), Some("wildcard"));
        assert_eq!(select("10.1.0.1", Some("db.example.com")).as_deref(), Some("exact"));
        assert_eq!(select("10.1.0.1", Some("other.org")).as_deref(), Some("office"));
    }

    #[test]
    fn test_build_errors() {
        let runtime = SharedRuntime::new(None, None);
        let listener = Listener {
            name: "bad".into(),
            filter_chains: vec![tcp_chain("bad", &["not-a-cidr"], &[])],
            ..Default::default()
        };
        assert!(matches!(
            ListenerState::build(&listener, &Snapshot::default(), &runtime),
            Err(ProxyError::InvalidConfiguration(_))
        ));

        let (listener, _) = http_snapshot("hi");
        assert!(matches!(
            ListenerState::build(&listener, &Snapshot::default(), &runtime),
            Err(ProxyError::InvalidConfiguration(_))
        ));
    }

    async fn get(addr: SocketAddr, prefix: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(prefix).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: petstore.example.com\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_and_swaps_state() {
        let runtime = SharedRuntime::new(None, None);
        let (listener, snapshot) = http_snapshot("first");
        let state = Arc::new(ListenerState::build(&listener, &snapshot, &runtime).unwrap());
        let (state_tx, state_rx) = watch::channel(state);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let server = tokio::spawn(serve(tcp, state_rx, shutdown_rx));

        let response = get(addr, b"PROXY TCP4 192.168.0.1 10.0.0.1 56324 8080\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("first\n"));

        let (listener, snapshot) = http_snapshot("second");
        state_tx
            .send(Arc::new(ListenerState::build(&listener, &snapshot, &runtime).unwrap()))
            .unwrap();
        let response = get(addr, b"").await;
        assert!(response.ends_with("second\n"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
