//! Policy layering
//!
//! A route's effective policy is the most specific value present: the route's
//! own, else its virtual host's, else the listener's.

use edge_api::v1::options::{CorsPolicy, HttpListenerOptions, RouteOptions, VirtualHostOptions};
use edge_api::xds::RoutePolicies;

/// Most specific of the three scopes
pub fn layer<T: Clone>(route: Option<&T>, virtual_host: Option<&T>, listener: Option<&T>) -> Option<T> {
    route.or(virtual_host).or(listener).cloned()
}

/// CORS set on a route with `disable_for_route` switches CORS off for it
fn layer_cors(
    route: Option<&CorsPolicy>,
    virtual_host: Option<&CorsPolicy>,
    listener: Option<&CorsPolicy>,
) -> Option<CorsPolicy> {
    match route {
        Some(cors) if cors.disable_for_route => None,
        _ => layer(route, virtual_host, listener),
    }
}

pub fn effective_policies(
    listener: &HttpListenerOptions,
    virtual_host: &VirtualHostOptions,
    route: &RouteOptions,
) -> RoutePolicies {
    RoutePolicies {
        cors: layer_cors(route.cors.as_ref(), virtual_host.cors.as_ref(), listener.cors.as_ref()),
        // compiled with its secrets by the translator
        ext_auth: None,
        // Listener DLP rules carry their own matchers and stay on the connection manager
        dlp: layer(route.dlp.as_ref(), virtual_host.dlp.as_ref(), None),
        rate_limit: layer(
            route.rate_limit.as_ref(),
            virtual_host.rate_limit.as_ref(),
            listener.rate_limit.as_ref(),
        ),
        tracing: layer(route.tracing.as_ref(), virtual_host.tracing.as_ref(), None),
        timeout_ms: route.timeout_ms,
        retries: layer(route.retries.as_ref(), virtual_host.retries.as_ref(), None),
        prefix_rewrite: route.prefix_rewrite.clone(),
        host_rewrite: route.host_rewrite.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::options::dlp::{DlpAction, DlpActionType, DlpConfig};
    use edge_api::v1::options::rate_limit::{Descriptor, RateLimitPolicy, RateLimitRule, TimeUnit};
    use edge_api::v1::options::RouteTracing;

    fn cors(origin: &str) -> CorsPolicy {
        CorsPolicy {
            allow_origin: vec![origin.to_string()],
            ..Default::default()
        }
    }

    fn rate_limit(rpu: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            rules: vec![RateLimitRule {
                name: format!("rpu-{}", rpu),
                descriptor: Descriptor::RemoteAddress,
                requests_per_unit: rpu,
                unit: TimeUnit::Minute,
            }],
        }
    }

    #[test]
    fn test_route_overrides_virtual_host_overrides_listener() {
        let listener = HttpListenerOptions {
            cors: Some(cors("https://listener.example")),
            rate_limit: Some(rate_limit(100)),
            ..Default::default()
        };
        let vhost = VirtualHostOptions {
            cors: Some(cors("https://vhost.example")),
            ..Default::default()
        };
        let route = RouteOptions {
            rate_limit: Some(rate_limit(5)),
            ..Default::default()
        };

        let policies = effective_policies(&listener, &vhost, &route);
        assert_eq!(policies.cors, Some(cors("https://vhost.example")));
        assert_eq!(policies.rate_limit, Some(rate_limit(5)));

        let policies = effective_policies(&listener, &VirtualHostOptions::default(), &RouteOptions::default());
        assert_eq!(policies.cors, Some(cors("https://listener.example")));
        assert_eq!(policies.rate_limit, Some(rate_limit(100)));
    }

    #[test]
    fn test_disable_cors_for_route() {
        let vhost = VirtualHostOptions {
            cors: Some(cors("https://vhost.example")),
            ..Default::default()
        };
        let route = RouteOptions {
            cors: Some(CorsPolicy {
                disable_for_route: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let policies = effective_policies(&HttpListenerOptions::default(), &vhost, &route);
        assert_eq!(policies.cors, None);
    }

    #[test]
    fn test_dlp_and_tracing_fall_back_to_virtual_host() {
        let dlp = DlpConfig {
            actions: vec![DlpAction {
                action_type: DlpActionType::Ssn,
                custom_action: None,
                shadow: false,
            }],
            ..Default::default()
        };
        let vhost = VirtualHostOptions {
            dlp: Some(dlp.clone()),
            tracing: Some(RouteTracing {
                route_descriptor: Some("petstore".into()),
                propagate: true,
            }),
            ..Default::default()
        };
        let route = RouteOptions {
            timeout_ms: Some(1500),
            ..Default::default()
        };
        let policies = effective_policies(&HttpListenerOptions::default(), &vhost, &route);
        assert_eq!(policies.dlp, Some(dlp));
        assert_eq!(
            policies.tracing.and_then(|t| t.route_descriptor).as_deref(),
            Some("petstore")
        );
        assert_eq!(policies.timeout_ms, Some(1500));
    }
}
