//! Cluster type, load balancing, health checking and connection settings

use super::{Params, UpstreamPlugin};
use crate::Result;
use edge_api::xds::{Cluster, ClusterKind};
use edge_api::{ResourceRef, Upstream};

pub struct UpstreamBasePlugin;

impl UpstreamPlugin for UpstreamBasePlugin {
    fn name(&self) -> &'static str {
        "upstream"
    }

    fn process_upstream(&self, params: &Params<'_>, upstream: &Upstream, cluster: &mut Cluster) -> Result<()> {
        let spec = &upstream.spec;
        let discovered = params.endpoints.contains_key(&ResourceRef::of(upstream).key());

        cluster.kind = if spec.failover.is_some() || discovered || spec.kube_service.is_some() {
            ClusterKind::Eds
        } else if spec.static_hosts.iter().all(|h| h.is_ip()) {
            ClusterKind::Static
        } else {
            ClusterKind::StrictDns
        };

        if let Some(lb) = &spec.load_balancer_config {
            cluster.lb = lb.clone();
        }
        cluster.health_checks = spec.health_checks.clone();
        cluster.outlier_detection = spec.outlier_detection.clone();
        cluster.http2 = spec.use_http2;
        cluster.connect_timeout_ms = spec
            .connection_config
            .as_ref()
            .and_then(|c| c.connect_timeout_ms);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{static_upstream, upstream};
    use edge_api::v1::options::{HealthCheck, LoadBalancerConfig, LoadBalancerPolicy};
    use edge_api::v1::upstream::{Host, UpstreamSpec};
    use edge_core::{ApiSnapshot, Endpoint};
    use std::collections::HashMap;

    fn process(us: &Upstream, endpoints: &HashMap<String, Vec<Endpoint>>) -> Cluster {
        let snapshot = ApiSnapshot::default();
        let params = Params::new(&snapshot, endpoints);
        let mut cluster = Cluster::default();
        UpstreamBasePlugin.process_upstream(&params, us, &mut cluster).unwrap();
        cluster
    }

    #[test]
    fn test_cluster_kind() {
        let none = HashMap::new();
        let ip = static_upstream("default", "ip", "10.0.0.1", 80);
        assert_eq!(process(&ip, &none).kind, ClusterKind::Static);

        let dns = static_upstream("default", "dns", "petstore.example.com", 80);
        assert_eq!(process(&dns, &none).kind, ClusterKind::StrictDns);

        let mut discovered = HashMap::new();
        discovered.insert("default.ip".to_string(), vec![Endpoint::new("10.1.0.1", 8080)]);
        assert_eq!(process(&ip, &discovered).kind, ClusterKind::Eds);
    }

    #[test]
    fn test_copies_lb_and_health_checks() {
        let us = upstream(
            "default",
            "petstore",
            UpstreamSpec {
                static_hosts: vec![Host::new("10.0.0.1", 80)],
                health_checks: vec![HealthCheck::default()],
                load_balancer_config: Some(LoadBalancerConfig {
                    policy: LoadBalancerPolicy::Random,
                    ..Default::default()
                }),
                use_http2: true,
                ..Default::default()
            },
        );
        let cluster = process(&us, &HashMap::new());
        assert_eq!(cluster.lb.policy, LoadBalancerPolicy::Random);
        assert_eq!(cluster.health_checks.len(), 1);
        assert!(cluster.http2);
    }
}
