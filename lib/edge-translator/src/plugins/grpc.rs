//! gRPC-Web filter and gRPC-JSON transcoding

use super::{HttpConnectionManagerPlugin, Params, UpstreamPlugin};
use crate::{Result, TranslateError};
use edge_api::v1::proxy::HttpListener;
use edge_api::xds::{Cluster, FilterStage, HttpConnectionManager, HttpFilter};
use edge_api::Upstream;

pub const GRPC_WEB_FILTER: &str = "grpc_web";

/// Enabled on every HTTP listener unless explicitly disabled
pub struct GrpcWebPlugin;

impl HttpConnectionManagerPlugin for GrpcWebPlugin {
    fn name(&self) -> &'static str {
        GRPC_WEB_FILTER
    }

    fn process_hcm(&self, _params: &Params<'_>, http: &HttpListener, hcm: &mut HttpConnectionManager) -> Result<()> {
        let disabled = http.options.grpc_web.as_ref().is_some_and(|g| g.disable);
        if !disabled {
            hcm.http_filters.push(HttpFilter {
                name: GRPC_WEB_FILTER.to_string(),
                stage: FilterStage::Fault,
            });
        }
        Ok(())
    }
}

pub struct GrpcJsonTranscoderPlugin;

impl UpstreamPlugin for GrpcJsonTranscoderPlugin {
    fn name(&self) -> &'static str {
        "grpc_json"
    }

    fn process_upstream(&self, _params: &Params<'_>, upstream: &Upstream, cluster: &mut Cluster) -> Result<()> {
        let Some(transcoder) = &upstream.spec.grpc_json_transcoder else {
            return Ok(());
        };
        if transcoder.services.is_empty() {
            return Err(TranslateError::InvalidConfiguration(
                "gRPC JSON transcoder requires at least one service".into(),
            ));
        }
        cluster.grpc_json_transcoder = Some(transcoder.clone());
        cluster.http2 = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::static_upstream;
    use edge_api::v1::options::{GrpcJsonTranscoder, GrpcWeb, HttpListenerOptions};
    use edge_core::ApiSnapshot;
    use std::collections::HashMap;

    #[test]
    fn test_grpc_web_default_on() {
        let snapshot = ApiSnapshot::default();
        let endpoints = HashMap::new();
        let params = Params::new(&snapshot, &endpoints);

        let mut hcm = HttpConnectionManager::default();
        GrpcWebPlugin
            .process_hcm(&params, &HttpListener::default(), &mut hcm)
            .unwrap();
        assert!(hcm.has_filter(GRPC_WEB_FILTER));

        let disabled = HttpListener {
            options: HttpListenerOptions {
                grpc_web: Some(GrpcWeb { disable: true }),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut hcm = HttpConnectionManager::default();
        GrpcWebPlugin.process_hcm(&params, &disabled, &mut hcm).unwrap();
        assert!(!hcm.has_filter(GRPC_WEB_FILTER));
    }

    #[test]
    fn test_transcoder_needs_services() {
        let snapshot = ApiSnapshot::default();
        let endpoints = HashMap::new();
        let params = Params::new(&snapshot, &endpoints);

        let mut us = static_upstream("default", "grpc", "10.0.0.1", 9000);
        us.spec.grpc_json_transcoder = Some(GrpcJsonTranscoder::default());
        assert!(GrpcJsonTranscoderPlugin
            .process_upstream(&params, &us, &mut Cluster::default())
            .is_err());

        us.spec.grpc_json_transcoder = Some(GrpcJsonTranscoder {
            services: vec!["bookstore.Bookstore".into()],
            ..Default::default()
        });
        let mut cluster = Cluster::default();
        GrpcJsonTranscoderPlugin
            .process_upstream(&params, &us, &mut cluster)
            .unwrap();
        assert!(cluster.http2);
    }
}
