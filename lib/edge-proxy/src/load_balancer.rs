//! Load balancing across the hosts chosen by priority and locality

use crate::cluster::Host;
use edge_api::v1::options::load_balancer::{LeastRequestConfig, RingHashConfig};
use edge_api::v1::options::LoadBalancerPolicy;
use lru::LruCache;
use rand::seq::SliceRandom;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Lookup table size for Maglev; must be prime
pub const MAGLEV_TABLE_SIZE: u64 = 65537;

const TABLE_CACHE_SIZE: usize = 16;

const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// 64-bit FNV-1a
pub fn fnv1a(bytes: &[u8]) -> u64 {
    fnv1a_seeded(FNV_OFFSET_BASIS, bytes)
}

fn fnv1a_seeded(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

enum HashTable {
    /// Sorted (hash, host index) points
    Ring(Vec<(u64, usize)>),
    /// Host index per slot
    Maglev(Vec<usize>),
}

pub struct LoadBalancer {
    policy: LoadBalancerPolicy,
    round_robin_counter: AtomicUsize,
    // keyed by the host set, which changes with health
    tables: Mutex<LruCache<u64, Arc<HashTable>>>,
}

impl LoadBalancer {
    pub fn new(policy: LoadBalancerPolicy) -> Self {
        Self {
            policy,
            round_robin_counter: AtomicUsize::new(0),
            tables: Mutex::new(LruCache::new(
                NonZeroUsize::new(TABLE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn policy(&self) -> &LoadBalancerPolicy {
        &self.policy
    }

    /// Pick one of `hosts`. Hash policies use `hash_key` and fall back to
    /// random selection without one.
    pub fn select(&self, hosts: &[Arc<Host>], hash_key: Option<&str>) -> Option<Arc<Host>> {
        match hosts.len() {
            0 => return None,
            1 => return Some(hosts[0].clone()),
            _ => {}
        }

        let index = match (&self.policy, hash_key) {
            (LoadBalancerPolicy::RoundRobin, _) => self.select_round_robin(hosts),
            (LoadBalancerPolicy::LeastRequest(config), _) => Self::select_least_request(hosts, config),
            (LoadBalancerPolicy::RingHash(config), Some(key)) => {
                let table = self.table(hosts, |hosts| build_ring(hosts, config));
                lookup(&table, fnv1a(key.as_bytes()))
            }
            (LoadBalancerPolicy::Maglev, Some(key)) => {
                let table = self.table(hosts, build_maglev);
                lookup(&table, fnv1a(key.as_bytes()))
            }
            (LoadBalancerPolicy::Random, _)
            | (LoadBalancerPolicy::RingHash(_), None)
            | (LoadBalancerPolicy::Maglev, None) => Self::select_random(hosts),
        };
        hosts.get(index).cloned()
    }

    /// Weighted round robin over the cumulative weights
    fn select_round_robin(&self, hosts: &[Arc<Host>]) -> usize {
        let total: u64 = hosts.iter().map(|h| effective_weight(h)).sum();
        let current = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) as u64 % total;
        pick_by_weight(hosts, current)
    }

    fn select_random(hosts: &[Arc<Host>]) -> usize {
        let total: u64 = hosts.iter().map(|h| effective_weight(h)).sum();
        pick_by_weight(hosts, rand::thread_rng().gen_range(0..total))
    }

    /// Power of N choices over in-flight request counts
    fn select_least_request(hosts: &[Arc<Host>], config: &LeastRequestConfig) -> usize {
        let choices = (config.choice_count.max(1) as usize).min(hosts.len());
        let indexes: Vec<usize> = (0..hosts.len()).collect();
        indexes
            .choose_multiple(&mut rand::thread_rng(), choices)
            .copied()
            .min_by_key(|i| hosts[*i].active_requests())
            .unwrap_or(0)
    }

    fn table(&self, hosts: &[Arc<Host>], build: impl FnOnce(&[Arc<Host>]) -> HashTable) -> Arc<HashTable> {
        let key = host_set_key(hosts);
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .get_or_insert(key, || Arc::new(build(hosts)))
            .clone()
    }
}

fn effective_weight(host: &Host) -> u64 {
    host.weight.max(1) as u64
}

fn pick_by_weight(hosts: &[Arc<Host>], mut point: u64) -> usize {
    for (i, host) in hosts.iter().enumerate() {
        let weight = effective_weight(host);
        if point < weight {
            return i;
        }
        point -= weight;
    }
    hosts.len() - 1
}

fn host_set_key(hosts: &[Arc<Host>]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for host in hosts {
        hash = fnv1a_seeded(hash, host.authority().as_bytes());
        hash = fnv1a_seeded(hash, &host.weight.to_le_bytes());
    }
    hash
}

fn lookup(table: &HashTable, hash: u64) -> usize {
    match table {
        HashTable::Ring(points) => {
            let at = points.partition_point(|(point, _)| *point < hash);
            points.get(at).or_else(|| points.first()).map_or(0, |(_, i)| *i)
        }
        HashTable::Maglev(slots) => slots[(hash % slots.len() as u64) as usize],
    }
}

/// Each host gets virtual nodes in proportion to its weight
fn build_ring(hosts: &[Arc<Host>], config: &RingHashConfig) -> HashTable {
    let total_weight: u64 = hosts.iter().map(|h| effective_weight(h)).sum();
    let ring_size = config
        .minimum_ring_size
        .max(hosts.len() as u64)
        .min(config.maximum_ring_size.max(hosts.len() as u64));

    let mut points = Vec::with_capacity(ring_size as usize);
    for (i, host) in hosts.iter().enumerate() {
        let replicas = (ring_size * effective_weight(host) / total_weight).max(1);
        let authority = host.authority();
        for replica in 0..replicas {
            let point = fnv1a(format!("{}_{}", authority, replica).as_bytes());
            points.push((point, i));
        }
    }
    points.sort_unstable();
    HashTable::Ring(points)
}

/// Weighted Maglev: hosts take turns claiming their next preferred free
/// slot, heavier hosts taking more turns
fn build_maglev(hosts: &[Arc<Host>]) -> HashTable {
    const EMPTY: usize = usize::MAX;
    let size = MAGLEV_TABLE_SIZE;
    let n = hosts.len();

    let (offsets, skips): (Vec<u64>, Vec<u64>) = hosts
        .iter()
        .map(|h| {
            let name = h.authority();
            let offset = fnv1a(name.as_bytes()) % size;
            let skip = fnv1a_seeded(FNV_OFFSET_BASIS ^ 0x9e37_79b9_7f4a_7c15, name.as_bytes())
                % (size - 1)
                + 1;
            (offset, skip)
        })
        .unzip();
    let weights: Vec<u64> = hosts.iter().map(|h| effective_weight(h)).collect();
    let max_weight = weights.iter().copied().max().unwrap_or(1);

    let mut table = vec![EMPTY; size as usize];
    let mut next = vec![0u64; n];
    let mut claimed = vec![0u64; n];
    let mut filled = 0u64;
    let mut round = 0u64;

    while filled < size {
        round += 1;
        for i in 0..n {
            let target = round * weights[i] / max_weight;
            while claimed[i] < target && filled < size {
                let mut slot = (offsets[i] + next[i] * skips[i]) % size;
                while table[slot as usize] != EMPTY {
                    next[i] += 1;
                    slot = (offsets[i] + next[i] * skips[i]) % size;
                }
                table[slot as usize] = i;
                next[i] += 1;
                claimed[i] += 1;
                filled += 1;
            }
        }
    }
    HashTable::Maglev(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn host(address: &str, weight: u32) -> Arc<Host> {
        let mut host = Host::new(address, 8080);
        host.weight = weight;
        Arc::new(host)
    }

    fn hosts() -> Vec<Arc<Host>> {
        vec![host("10.0.0.1", 1), host("10.0.0.2", 1), host("10.0.0.3", 1)]
    }

    fn keys() -> Vec<String> {
        (0..300).map(|i| format!("client-{}", i)).collect()
    }

    fn assignments(lb: &LoadBalancer, hosts: &[Arc<Host>]) -> HashMap<String, String> {
        keys()
            .into_iter()
            .map(|k| {
                let picked = lb.select(hosts, Some(k.as_str())).unwrap().address.clone();
                (k, picked)
            })
            .collect()
    }

    /// Share of keys not on the removed host that keep their host
    fn stability(policy: LoadBalancerPolicy) -> f64 {
        let lb = LoadBalancer::new(policy);
        let all = hosts();
        let before = assignments(&lb, &all);
        let after = assignments(&lb, &all[..2]);
        let survivors: Vec<_> = before.iter().filter(|(_, h)| *h != "10.0.0.3").collect();
        let kept = survivors.iter().filter(|(k, h)| after[*k] == **h).count();
        kept as f64 / survivors.len() as f64
    }

    #[test]
    fn test_fnv1a() {
        assert_eq!(fnv1a(b""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_empty_and_single() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin);
        assert!(lb.select(&[], None).is_none());
        let only = vec![host("10.0.0.1", 1)];
        assert_eq!(lb.select(&only, None).unwrap().address, "10.0.0.1");
    }

    #[test]
    fn test_weighted_round_robin() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RoundRobin);
        let hosts = vec![host("a", 1), host("b", 3)];
        let mut counts = HashMap::new();
        for _ in 0..8 {
            *counts.entry(lb.select(&hosts, None).unwrap().address.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 6);
    }

    #[test]
    fn test_least_request_avoids_busy_host() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::LeastRequest(LeastRequestConfig {
            choice_count: 2,
        }));
        let hosts = vec![host("busy", 1), host("idle", 1)];
        let _guards: Vec<_> = (0..5).map(|_| hosts[0].start_request()).collect();
        for _ in 0..20 {
            assert_eq!(lb.select(&hosts, None).unwrap().address, "idle");
        }
    }

    #[test]
    fn test_random_covers_hosts() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::Random);
        let hosts = hosts();
        let seen: std::collections::HashSet<_> = (0..200)
            .map(|_| lb.select(&hosts, None).unwrap().address.clone())
            .collect();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_ring_hash_is_consistent() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::RingHash(RingHashConfig::default()));
        let hosts = hosts();
        let first = assignments(&lb, &hosts);
        assert_eq!(first, assignments(&lb, &hosts));
        let distinct: std::collections::HashSet<_> = first.values().collect();
        assert_eq!(distinct.len(), 3);
        assert!(stability(LoadBalancerPolicy::RingHash(RingHashConfig::default())) > 0.6);
    }

    #[test]
    fn test_maglev_is_consistent() {
        let lb = LoadBalancer::new(LoadBalancerPolicy::Maglev);
        let hosts = hosts();
        let first = assignments(&lb, &hosts);
        assert_eq!(first, assignments(&lb, &hosts));
        let distinct: std::collections::HashSet<_> = first.values().collect();
        assert_eq!(distinct.len(), 3);
        assert!(stability(LoadBalancerPolicy::Maglev) > 0.6);
    }

    #[test]
    fn test_maglev_table_respects_weights() {
        let hosts = vec![host("light", 1), host("heavy", 3)];
        let HashTable::Maglev(table) = build_maglev(&hosts) else {
            panic!("expected maglev table");
        };
        assert_eq!(table.len() as u64, MAGLEV_TABLE_SIZE);
        let heavy = table.iter().filter(|i| **i == 1).count() as f64;
        let share = heavy / table.len() as f64;
        assert!((0.70..0.80).contains(&share), "heavy share {}", share);
    }
}
