//! Prometheus metrics for the translation loop

use crate::Result;
use edge_api::StatusState;
use edge_core::ResourceKind;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct TranslatorMetrics {
    pub syncs_total: IntCounter,
    pub sync_failures_total: IntCounter,
    /// Syncs skipped because neither resources nor endpoints changed
    pub syncs_skipped_total: IntCounter,
    /// Resources by kind and reported state
    pub resources: IntGaugeVec,
    /// Proxies served from the snapshot cache
    pub proxies: IntGauge,
    pub registry: Arc<Registry>,
}

impl TranslatorMetrics {
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Register into an existing registry, e.g. one shared with discovery
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let syncs_total = IntCounter::new("translator_syncs_total", "Completed translation syncs")?;
        let sync_failures_total =
            IntCounter::new("translator_sync_failures_total", "Syncs aborted by a client error")?;
        let syncs_skipped_total = IntCounter::new(
            "translator_syncs_skipped_total",
            "Syncs skipped because inputs were unchanged",
        )?;
        let resources = IntGaugeVec::new(
            Opts::new("translator_resources", "Resources by kind and reported state"),
            &["kind", "state"],
        )?;
        let proxies = IntGauge::new("translator_proxies", "Proxies with a served snapshot")?;

        registry.register(Box::new(syncs_total.clone()))?;
        registry.register(Box::new(sync_failures_total.clone()))?;
        registry.register(Box::new(syncs_skipped_total.clone()))?;
        registry.register(Box::new(resources.clone()))?;
        registry.register(Box::new(proxies.clone()))?;

        Ok(Self {
            syncs_total,
            sync_failures_total,
            syncs_skipped_total,
            resources,
            proxies,
            registry,
        })
    }

    /// Replace the per-state counts of one kind
    pub fn record_states(&self, kind: ResourceKind, states: &[StatusState]) {
        let kind = kind.to_string();
        for state in [
            StatusState::Pending,
            StatusState::Accepted,
            StatusState::Rejected,
            StatusState::Warning,
        ] {
            let count = states.iter().filter(|s| **s == state).count();
            self.resources
                .with_label_values(&[&kind, &state.to_string()])
                .set(count as i64);
        }
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_states() {
        let metrics = TranslatorMetrics::new().unwrap();
        metrics.record_states(
            ResourceKind::Proxy,
            &[StatusState::Accepted, StatusState::Rejected, StatusState::Accepted],
        );
        assert_eq!(
            metrics.resources.with_label_values(&["Proxy", "Accepted"]).get(),
            2
        );
        assert_eq!(
            metrics.resources.with_label_values(&["Proxy", "Pending"]).get(),
            0
        );

        metrics.syncs_total.inc();
        let text = metrics.gather().unwrap();
        assert!(text.contains("translator_syncs_total 1"));
        assert!(text.contains("translator_resources{kind=\"Proxy\",state=\"Rejected\"} 1"));
    }
}
