//! Priority and locality aware host selection
//!
//! Hosts are grouped into priority levels, each split by locality. Traffic
//! goes to the lowest priority that still has a healthy host. When no level
//! has one, or the healthy share of all hosts drops below the cluster's
//! panic threshold, every host of the first level is eligible.

use crate::cluster::Host;
use crate::load_balancer::LoadBalancer;
use edge_api::v1::options::{LoadBalancerConfig, Locality};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

struct LocalityGroup {
    locality: Locality,
    weight: u32,
    hosts: Vec<Arc<Host>>,
}

impl LocalityGroup {
    fn healthy(&self) -> Vec<Arc<Host>> {
        self.hosts.iter().filter(|h| h.is_healthy()).cloned().collect()
    }
}

struct PriorityLevel {
    priority: u32,
    localities: Vec<LocalityGroup>,
}

impl PriorityLevel {
    fn all_hosts(&self) -> Vec<Arc<Host>> {
        self.localities
            .iter()
            .flat_map(|l| l.hosts.iter().cloned())
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub host: Arc<Host>,
    pub priority: u32,
    pub panic: bool,
}

pub struct PrioritySelector {
    levels: Vec<PriorityLevel>,
    locality_weighted: bool,
    panic_threshold: Option<f64>,
}

impl PrioritySelector {
    pub fn new(hosts: &[Arc<Host>], config: &LoadBalancerConfig) -> Self {
        let mut grouped: BTreeMap<u32, BTreeMap<Locality, LocalityGroup>> = BTreeMap::new();
        for host in hosts {
            let group = grouped
                .entry(host.priority)
                .or_default()
                .entry(host.locality.clone())
                .or_insert_with(|| LocalityGroup {
                    locality: host.locality.clone(),
                    weight: host.locality_weight.unwrap_or(1),
                    hosts: Vec::new(),
                });
            group.hosts.push(host.clone());
        }

        let levels = grouped
            .into_iter()
            .map(|(priority, localities)| PriorityLevel {
                priority,
                localities: localities.into_values().collect(),
            })
            .collect();

        Self {
            levels,
            locality_weighted: config.locality_weighted,
            panic_threshold: config.healthy_panic_threshold.filter(|t| *t > 0.0),
        }
    }

    pub fn priorities(&self) -> Vec<u32> {
        self.levels.iter().map(|l| l.priority).collect()
    }

    pub fn select(&self, lb: &LoadBalancer, hash_key: Option<&str>) -> Option<Selection> {
        if !self.below_panic_threshold() {
            for level in &self.levels {
                if let Some(host) = self.select_in_level(level, lb, hash_key) {
                    return Some(Selection {
                        host,
                        priority: level.priority,
                        panic: false,
                    });
                }
            }
        }

        let first = self.levels.first()?;
        let host = lb.select(&first.all_hosts(), hash_key)?;
        Some(Selection {
            host,
            priority: first.priority,
            panic: true,
        })
    }

    fn select_in_level(
        &self,
        level: &PriorityLevel,
        lb: &LoadBalancer,
        hash_key: Option<&str>,
    ) -> Option<Arc<Host>> {
        if !self.locality_weighted {
            let healthy: Vec<Arc<Host>> = level.localities.iter().flat_map(|l| l.healthy()).collect();
            return lb.select(&healthy, hash_key);
        }

        // weight each locality by its share of healthy hosts
        let candidates: Vec<(f64, Vec<Arc<Host>>)> = level
            .localities
            .iter()
            .filter_map(|locality| {
                let healthy = locality.healthy();
                if healthy.is_empty() || locality.weight == 0 {
                    return None;
                }
                let share = healthy.len() as f64 / locality.hosts.len() as f64;
                Some((locality.weight as f64 * share, healthy))
            })
            .collect();
        let total: f64 = candidates.iter().map(|(w, _)| w).sum();
        if candidates.is_empty() || total <= 0.0 {
            return None;
        }

        let mut point = rand::thread_rng().gen_range(0.0..total);
        for (weight, hosts) in &candidates {
            if point < *weight {
                return lb.select(hosts, hash_key);
            }
            point -= weight;
        }
        candidates.last().and_then(|(_, hosts)| lb.select(hosts, hash_key))
    }

    fn below_panic_threshold(&self) -> bool {
        let Some(threshold) = self.panic_threshold else {
            return false;
        };
        let total: usize = self.levels.iter().map(|l| l.all_hosts().len()).sum();
        if total == 0 {
            return false;
        }
        let healthy = self
            .levels
            .iter()
            .flat_map(|l| l.localities.iter())
            .map(|l| l.healthy().len())
            .sum::<usize>();
        (healthy as f64 * 100.0 / total as f64) < threshold
    }

    /// Localities of each level, for the admin config dump
    pub fn describe(&self) -> Vec<(u32, Vec<(Locality, usize, usize)>)> {
        self.levels
            .iter()
            .map(|level| {
                let localities = level
                    .localities
                    .iter()
                    .map(|l| (l.locality.clone(), l.healthy().len(), l.hosts.len()))
                    .collect();
                (level.priority, localities)
            })
            .collect()
    }
}
