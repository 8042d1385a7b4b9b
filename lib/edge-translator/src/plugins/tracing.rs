//! Listener tracing configuration

use super::{HttpConnectionManagerPlugin, Params};
use crate::{Result, TranslateError};
use edge_api::v1::proxy::HttpListener;
use edge_api::xds::HttpConnectionManager;

pub struct TracingPlugin;

impl HttpConnectionManagerPlugin for TracingPlugin {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn process_hcm(&self, params: &Params<'_>, http: &HttpListener, hcm: &mut HttpConnectionManager) -> Result<()> {
        let Some(tracing) = &http.options.tracing else {
            return Ok(());
        };
        if !(0.0..=100.0).contains(&tracing.random_sampling_percentage) {
            return Err(TranslateError::InvalidConfiguration(format!(
                "tracing sampling percentage {} is not within [0, 100]",
                tracing.random_sampling_percentage
            )));
        }
        if let Some(provider) = &tracing.provider {
            let collector = provider.collector_upstream();
            if params.snapshot.upstream(collector).is_none() {
                return Err(TranslateError::InvalidConfiguration(format!(
                    "tracing collector upstream {} not found",
                    collector
                )));
            }
        }
        hcm.tracing = Some(tracing.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::static_upstream;
    use edge_api::v1::options::tracing::ZipkinConfig;
    use edge_api::v1::options::{HttpListenerOptions, ListenerTracing, TracingProvider};
    use edge_api::ResourceRef;
    use edge_core::ApiSnapshot;
    use std::collections::HashMap;

    fn listener(collector: &str) -> HttpListener {
        HttpListener {
            options: HttpListenerOptions {
                tracing: Some(ListenerTracing {
                    provider: Some(TracingProvider::Zipkin(ZipkinConfig {
                        collector_upstream_ref: ResourceRef::new("default", collector),
                        collector_endpoint: "/api/v2/spans".into(),
                    })),
                    random_sampling_percentage: 100.0,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_collector_must_exist() {
        let snapshot = ApiSnapshot {
            upstreams: vec![static_upstream("default", "zipkin", "10.0.0.9", 9411)],
            ..Default::default()
        };
        let endpoints = HashMap::new();
        let params = Params::new(&snapshot, &endpoints);

        let mut hcm = HttpConnectionManager::default();
        TracingPlugin.process_hcm(&params, &listener("zipkin"), &mut hcm).unwrap();
        assert!(hcm.tracing.is_some());

        let err = TracingPlugin
            .process_hcm(&params, &listener("jaeger"), &mut HttpConnectionManager::default())
            .unwrap_err();
        assert!(err.to_string().contains("default.jaeger"));
    }
}
