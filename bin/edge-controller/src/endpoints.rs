//! Kubernetes endpoint discovery
//!
//! Reconciles core/v1 Endpoints into the [`EndpointRegistry`] for every
//! Upstream that references the backing Service.

use edge_api::{ResourceRef, Upstream};
use edge_core::{Endpoint, EndpointRegistry, ResourceClient, StatusClient};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::{Api, Client, ResourceExt};
use kube_runtime::{controller::Action, Controller};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to list upstreams: {0}")]
    Upstreams(#[from] edge_core::CoreError),
}

struct Context {
    client: Client,
    upstreams: Arc<dyn StatusClient<Upstream>>,
    registry: EndpointRegistry,
}

pub struct EndpointDiscovery {
    ctx: Arc<Context>,
}

impl EndpointDiscovery {
    pub fn new(client: Client, upstreams: Arc<dyn StatusClient<Upstream>>, registry: EndpointRegistry) -> Self {
        Self {
            ctx: Arc::new(Context {
                client,
                upstreams,
                registry,
            }),
        }
    }

    pub async fn run(self) {
        info!("Starting endpoint discovery");

        let endpoints: Api<Endpoints> = Api::all(self.ctx.client.clone());
        let mut stream = Controller::new(endpoints, Default::default())
            .run(reconcile, error_policy, self.ctx.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((obj, _)) => debug!("Reconciled Endpoints {}/{}", obj.namespace.unwrap_or_default(), obj.name),
                Err(e) => error!("Error in endpoint discovery stream: {}", e),
            }
        }
    }
}

async fn reconcile(endpoints: Arc<Endpoints>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = endpoints.namespace().unwrap_or_default();
    let name = endpoints.name_any();

    let mut service = None;
    for upstream in ctx.upstreams.list(None).await? {
        let upstream_ns = upstream.namespace().unwrap_or_default();
        let Some(kube_service) = &upstream.spec.kube_service else {
            continue;
        };
        let service_ns = if kube_service.namespace.is_empty() {
            upstream_ns.as_str()
        } else {
            kube_service.namespace.as_str()
        };
        if kube_service.name != name || service_ns != namespace {
            continue;
        }

        if service.is_none() {
            let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
            service = Some(services.get(&name).await?);
        }
        let Some(service) = &service else {
            continue;
        };

        let discovered = endpoints_for(service, &endpoints, kube_service.port);
        let upstream_ref = ResourceRef::new(upstream_ns, upstream.name_any());
        if ctx.registry.update_endpoints(&upstream_ref, discovered).await {
            info!("Endpoints changed for upstream {}", upstream_ref);
        }
    }

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

fn error_policy(endpoints: Arc<Endpoints>, e: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!("Error reconciling Endpoints {}: {}", endpoints.name_any(), e);
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/// Endpoints backing `service_port` of a Service
///
/// The Service port is mapped to the endpoint port by name; an unnamed
/// single-port Service matches the only endpoint port.
pub fn endpoints_for(service: &Service, endpoints: &Endpoints, service_port: u16) -> Vec<Endpoint> {
    let Some(port) = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == i32::from(service_port)))
    else {
        return Vec::new();
    };

    let mut discovered = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let Some(target) = subset
            .ports
            .iter()
            .flatten()
            .find(|p| p.name == port.name)
            .and_then(|p| u16::try_from(p.port).ok())
        else {
            continue;
        };
        for address in subset.addresses.iter().flatten() {
            discovered.push(Endpoint::new(address.ip.clone(), target));
        }
        for address in subset.not_ready_addresses.iter().flatten() {
            let mut endpoint = Endpoint::new(address.ip.clone(), target);
            endpoint.ready = false;
            discovered.push(endpoint);
        }
    }
    discovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, ServicePort, ServiceSpec};

    fn service(ports: Vec<(Option<&str>, i32)>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .into_iter()
                        .map(|(name, port)| ServicePort {
                            name: name.map(String::from),
                            port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn endpoints() -> Endpoints {
        Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![address("10.1.0.1"), address("10.1.0.2")]),
                not_ready_addresses: Some(vec![address("10.1.0.3")]),
                ports: Some(vec![
                    EndpointPort {
                        name: Some("http".into()),
                        port: 8080,
                        ..Default::default()
                    },
                    EndpointPort {
                        name: Some("grpc".into()),
                        port: 9090,
                        ..Default::default()
                    },
                ]),
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_maps_service_port_by_name() {
        let service = service(vec![(Some("http"), 80), (Some("grpc"), 9000)]);
        let discovered = endpoints_for(&service, &endpoints(), 80);
        assert_eq!(discovered.len(), 3);
        assert!(discovered.iter().all(|e| e.port == 8080));
        assert_eq!(discovered.iter().filter(|e| e.ready).count(), 2);
        assert!(!discovered[2].ready);

        let grpc = endpoints_for(&service, &endpoints(), 9000);
        assert!(grpc.iter().all(|e| e.port == 9090));
    }

    #[test]
    fn test_unknown_service_port() {
        let service = service(vec![(Some("http"), 80)]);
        assert!(endpoints_for(&service, &endpoints(), 443).is_empty());
    }

    #[test]
    fn test_unnamed_port() {
        let service = service(vec![(None, 80)]);
        let endpoints = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![address("10.1.0.9")]),
                ports: Some(vec![EndpointPort {
                    port: 3000,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(endpoints_for(&service, &endpoints, 80), vec![Endpoint::new("10.1.0.9", 3000)]);
    }
}
