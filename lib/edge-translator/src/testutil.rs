//! Builders shared by the unit tests

use edge_api::v1::gateway::{GatewaySpec, GatewayType, HttpGateway};
use edge_api::v1::proxy::{Action, Destination, Matcher, Route, RouteAction};
use edge_api::v1::secret::{SecretKind, SecretSpec, TlsSecret};
use edge_api::v1::upstream::{Host, UpstreamSpec};
use edge_api::v1::virtual_service::{VirtualServiceHost, VirtualServiceSpec};
use edge_api::{Gateway, ResourceRef, Secret, Upstream, VirtualService};

pub fn upstream(namespace: &str, name: &str, spec: UpstreamSpec) -> Upstream {
    let mut us = Upstream::new(name, spec);
    us.metadata.namespace = Some(namespace.to_string());
    us
}

pub fn static_upstream(namespace: &str, name: &str, addr: &str, port: u16) -> Upstream {
    upstream(
        namespace,
        name,
        UpstreamSpec {
            static_hosts: vec![Host::new(addr, port)],
            ..Default::default()
        },
    )
}

pub fn tls_secret(namespace: &str, name: &str) -> Secret {
    Secret::tls(
        namespace,
        name,
        TlsSecret {
            cert_chain: "CERT".into(),
            private_key: "KEY".into(),
            root_ca: String::new(),
        },
    )
}

pub fn generic_secret(namespace: &str, name: &str) -> Secret {
    let mut secret = Secret::new(
        name,
        SecretSpec {
            kind: SecretKind::Generic(Default::default()),
        },
    );
    secret.metadata.namespace = Some(namespace.to_string());
    secret
}

pub fn route_to(prefix: &str, upstream: &str) -> Route {
    Route {
        matchers: vec![Matcher::prefix(prefix)],
        action: Some(Action::Route(RouteAction::Single(Destination {
            upstream: ResourceRef::new("", upstream),
        }))),
        ..Default::default()
    }
}

pub fn virtual_service(namespace: &str, name: &str, domains: &[&str], routes: Vec<Route>) -> VirtualService {
    let mut vs = VirtualService::new(
        name,
        VirtualServiceSpec {
            virtual_host: Some(VirtualServiceHost {
                domains: domains.iter().map(|d| d.to_string()).collect(),
                routes,
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    vs.metadata.namespace = Some(namespace.to_string());
    vs
}

pub fn http_gateway(namespace: &str, name: &str, port: u16) -> Gateway {
    let mut gw = Gateway::new(
        name,
        GatewaySpec {
            bind_address: "::".into(),
            bind_port: port,
            gateway_type: GatewayType::Http(HttpGateway::default()),
            ..Default::default()
        },
    );
    gw.metadata.namespace = Some(namespace.to_string());
    gw
}
