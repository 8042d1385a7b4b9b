//! Prioritized failover endpoints
//!
//! The upstream's own hosts are priority 0. Locality group `i` of the
//! failover configuration becomes priority `i + 1`, so the data plane only
//! sends traffic to it when every higher priority is unhealthy.

use super::tls::upstream_tls;
use super::{EndpointPlugin, Params};
use crate::{Result, TranslateError};
use edge_api::v1::options::LocalityLbEndpoints as FailoverLocality;
use edge_api::xds::{ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints};
use edge_api::Upstream;
use kube::ResourceExt;
use std::net::IpAddr;

pub struct FailoverPlugin;

impl EndpointPlugin for FailoverPlugin {
    fn name(&self) -> &'static str {
        "failover"
    }

    fn process_endpoints(
        &self,
        params: &Params<'_>,
        upstream: &Upstream,
        assignment: &mut ClusterLoadAssignment,
    ) -> Result<()> {
        let Some(failover) = &upstream.spec.failover else {
            return Ok(());
        };
        if upstream.spec.health_checks.is_empty() && upstream.spec.outlier_detection.is_none() {
            return Err(TranslateError::FailoverWithoutHealthChecks);
        }

        let namespace = upstream.namespace().unwrap_or_default();
        for (idx, group) in failover.prioritized_localities.iter().enumerate() {
            let priority = idx as u32 + 1;
            for locality in &group.locality_endpoints {
                validate_locality(locality)?;
                let mut lb_endpoints = Vec::with_capacity(locality.lb_endpoints.len());
                for ep in &locality.lb_endpoints {
                    // hostnames double as SNI, as for the upstream's own hosts
                    let default_sni = ep.address.parse::<IpAddr>().is_err().then(|| ep.address.clone());
                    let tls = ep
                        .upstream_ssl_config
                        .as_ref()
                        .map(|ssl| upstream_tls(params.snapshot, ssl, &namespace, default_sni))
                        .transpose()?;
                    lb_endpoints.push(LbEndpoint {
                        address: ep.address.clone(),
                        port: ep.port,
                        weight: ep.load_balancing_weight.unwrap_or(1),
                        health_check_path: ep.health_check_path.clone(),
                        tls,
                    });
                }
                assignment.endpoints.push(LocalityLbEndpoints {
                    locality: locality.locality.clone(),
                    priority,
                    load_balancing_weight: locality.load_balancing_weight,
                    lb_endpoints,
                });
            }
        }
        Ok(())
    }
}

/// DNS names may resolve to several addresses, so per-endpoint weights are
/// ambiguous next to them
fn validate_locality(locality: &FailoverLocality) -> Result<()> {
    let has_dns = locality
        .lb_endpoints
        .iter()
        .any(|ep| ep.address.parse::<IpAddr>().is_err());
    let weighted = locality
        .lb_endpoints
        .iter()
        .any(|ep| ep.load_balancing_weight.is_some());
    if has_dns && weighted {
        return Err(TranslateError::FailoverDnsWeight);
    }
    Ok(())
}
