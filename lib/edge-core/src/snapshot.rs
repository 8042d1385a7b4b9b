//! Point-in-time view of every input resource

use edge_api::{Gateway, HasStatus, Proxy, ResourceRef, Secret, Upstream, VirtualService};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, Default)]
pub struct ApiSnapshot {
    pub gateways: Vec<Gateway>,
    pub virtual_services: Vec<VirtualService>,
    pub upstreams: Vec<Upstream>,
    pub proxies: Vec<Proxy>,
    pub secrets: Vec<Secret>,
}

impl ApiSnapshot {
    pub fn upstream(&self, r: &ResourceRef) -> Option<&Upstream> {
        find(&self.upstreams, r)
    }

    pub fn secret(&self, r: &ResourceRef) -> Option<&Secret> {
        find(&self.secrets, r)
    }

    pub fn virtual_service(&self, r: &ResourceRef) -> Option<&VirtualService> {
        find(&self.virtual_services, r)
    }

    pub fn proxy(&self, r: &ResourceRef) -> Option<&Proxy> {
        find(&self.proxies, r)
    }

    /// Every reported kind carries a terminal status computed from its
    /// current generation
    pub fn converged(&self) -> bool {
        all_observed(&self.gateways)
            && all_observed(&self.virtual_services)
            && all_observed(&self.upstreams)
            && all_observed(&self.proxies)
    }

    /// Hash of identities, labels and specs; statuses are ignored so that
    /// writing statuses does not look like an input change
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hash_kind(&mut hasher, &self.gateways, |g| &g.spec);
        hash_kind(&mut hasher, &self.virtual_services, |v| &v.spec);
        hash_kind(&mut hasher, &self.upstreams, |u| &u.spec);
        hash_kind(&mut hasher, &self.proxies, |p| &p.spec);
        hash_kind(&mut hasher, &self.secrets, |s| &s.spec);
        hex::encode(hasher.finalize())
    }
}

fn find<'a, K: Resource>(items: &'a [K], r: &ResourceRef) -> Option<&'a K> {
    items
        .iter()
        .find(|k| k.name_any() == r.name && k.namespace().as_deref() == Some(r.namespace.as_str()))
}

fn all_observed<K: Resource + HasStatus>(items: &[K]) -> bool {
    items.iter().all(|k| {
        k.status()
            .is_some_and(|s| s.state.is_terminal() && s.observed_generation == k.meta().generation)
    })
}

fn hash_kind<K, S, F>(hasher: &mut Sha256, items: &[K], spec: F)
where
    K: Resource<DynamicType = ()>,
    S: Serialize,
    F: Fn(&K) -> &S,
{
    let mut entries: Vec<(String, Vec<u8>)> = items
        .iter()
        .map(|k| {
            let id = format!("{}/{}/{:?}", k.namespace().unwrap_or_default(), k.name_any(), k.labels());
            (id, serde_json::to_vec(spec(k)).unwrap_or_default())
        })
        .collect();
    entries.sort();
    hasher.update(K::kind(&()).as_bytes());
    for (id, spec) in entries {
        hasher.update(id.as_bytes());
        hasher.update(&spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::upstream::{Host, UpstreamSpec};
    use edge_api::Status;

    fn upstream(name: &str, port: u16) -> Upstream {
        let mut us = Upstream::new(
            name,
            UpstreamSpec {
                static_hosts: vec![Host::new("10.0.0.1", port)],
                ..Default::default()
            },
        );
        us.metadata.namespace = Some("default".into());
        us
    }

    #[test]
    fn test_hash_ignores_status() {
        let mut snap = ApiSnapshot {
            upstreams: vec![upstream("a", 80)],
            ..Default::default()
        };
        let before = snap.hash();
        snap.upstreams[0].status = Some(Status::accepted());
        assert_eq!(before, snap.hash());

        snap.upstreams[0].spec.static_hosts[0].port = 81;
        assert_ne!(before, snap.hash());
    }

    #[test]
    fn test_converged_tracks_generation() {
        let mut snap = ApiSnapshot {
            upstreams: vec![upstream("a", 80)],
            ..Default::default()
        };
        assert!(!snap.converged());

        snap.upstreams[0].metadata.generation = Some(2);
        let mut status = Status::accepted();
        status.observed_generation = Some(1);
        snap.upstreams[0].status = Some(status.clone());
        assert!(!snap.converged());

        status.observed_generation = Some(2);
        snap.upstreams[0].status = Some(status);
        assert!(snap.converged());
        assert!(ApiSnapshot::default().converged());
    }

    #[test]
    fn test_lookup_by_ref() {
        let snap = ApiSnapshot {
            upstreams: vec![upstream("a", 80), upstream("b", 80)],
            ..Default::default()
        };
        assert!(snap.upstream(&ResourceRef::new("default", "b")).is_some());
        assert!(snap.upstream(&ResourceRef::new("other", "b")).is_none());
    }
}
