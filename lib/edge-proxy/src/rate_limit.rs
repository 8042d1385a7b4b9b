//! Local rate limiting
//!
//! Fixed windows: every rule counts requests per descriptor value in
//! windows aligned to the unix epoch and sized by the rule's unit. Counters
//! live in a bounded LRU map shared by all listeners, so snapshot updates do
//! not reset them.

use edge_api::v1::options::rate_limit::Descriptor;
use edge_api::v1::options::RateLimitPolicy;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::{HeaderMap, Response, StatusCode};
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const RATE_LIMITED_HEADER: &str = "x-envoy-ratelimited";

const DEFAULT_CAPACITY: usize = 100_000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct WindowKey {
    scope: String,
    rule: String,
    value: String,
    window: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { rule: String, retry_after: Duration },
}

/// What descriptors are computed from
pub struct DescriptorContext<'a> {
    pub remote_address: IpAddr,
    pub headers: &'a HeaderMap,
}

pub struct RateLimiter {
    windows: Mutex<LruCache<WindowKey, u32>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            windows: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn check(
        &self,
        scope: &str,
        policy: &RateLimitPolicy,
        ctx: &DescriptorContext<'_>,
    ) -> RateLimitDecision {
        self.check_at(scope, policy, ctx, SystemTime::now())
    }

    /// Count the request against every rule; limited when any rule is over
    pub fn check_at(
        &self,
        scope: &str,
        policy: &RateLimitPolicy,
        ctx: &DescriptorContext<'_>,
        now: SystemTime,
    ) -> RateLimitDecision {
        let now = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let mut decision = RateLimitDecision::Allowed;

        for rule in &policy.rules {
            let Some(value) = descriptor_value(&rule.descriptor, ctx) else {
                continue;
            };
            let unit = rule.unit.duration().as_secs();
            let window = now.as_secs() / unit;
            let key = WindowKey {
                scope: scope.to_string(),
                rule: rule.name.clone(),
                value,
                window,
            };
            let count = windows.get_or_insert_mut(key, || 0);
            *count = count.saturating_add(1);

            if *count > rule.requests_per_unit && decision == RateLimitDecision::Allowed {
                let window_end = Duration::from_secs((window + 1) * unit);
                debug!(scope = %scope, rule = %rule.name, count = *count, "Rate limit exceeded");
                decision = RateLimitDecision::Limited {
                    rule: rule.name.clone(),
                    retry_after: window_end.saturating_sub(now),
                };
            }
        }
        decision
    }

    /// The 429 sent for a limited request
    pub fn limited_response(retry_after: Duration) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        let headers = response.headers_mut();
        headers.insert(RATE_LIMITED_HEADER, HeaderValue::from_static("true"));
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
        response
    }

    pub fn len(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn descriptor_value(descriptor: &Descriptor, ctx: &DescriptorContext<'_>) -> Option<String> {
    match descriptor {
        Descriptor::RemoteAddress => Some(ctx.remote_address.to_string()),
        Descriptor::RequestHeader { header_name } => ctx
            .headers
            .get(header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        Descriptor::GenericKey { value } => Some(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::options::rate_limit::TimeUnit;
    use edge_api::v1::options::RateLimitRule;

    fn policy(descriptor: Descriptor, requests_per_unit: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            rules: vec![RateLimitRule {
                name: "per-client".into(),
                descriptor,
                requests_per_unit,
                unit: TimeUnit::Minute,
            }],
        }
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_fixed_window() {
        let limiter = RateLimiter::new();
        let headers = HeaderMap::new();
        let ctx = DescriptorContext {
            remote_address: "10.0.0.1".parse().unwrap(),
            headers: &headers,
        };
        let policy = policy(Descriptor::RemoteAddress, 2);

        assert_eq!(limiter.check_at("route", &policy, &ctx, at(600)), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("route", &policy, &ctx, at(610)), RateLimitDecision::Allowed);
        assert_eq!(
            limiter.check_at("route", &policy, &ctx, at(630)),
            RateLimitDecision::Limited {
                rule: "per-client".into(),
                retry_after: Duration::from_secs(30),
            }
        );
        // next window starts at 660
        assert_eq!(limiter.check_at("route", &policy, &ctx, at(660)), RateLimitDecision::Allowed);

        // other clients and other scopes count separately
        let other = DescriptorContext {
            remote_address: "10.0.0.2".parse().unwrap(),
            headers: &headers,
        };
        assert_eq!(limiter.check_at("route", &policy, &other, at(630)), RateLimitDecision::Allowed);
        assert_eq!(limiter.check_at("vhost", &policy, &ctx, at(630)), RateLimitDecision::Allowed);
    }

    #[test]
    fn test_header_descriptor_skips_requests_without_header() {
        let limiter = RateLimiter::new();
        let policy = policy(
            Descriptor::RequestHeader {
                header_name: "x-api-key".into(),
            },
            1,
        );
        let empty = HeaderMap::new();
        let anonymous = DescriptorContext {
            remote_address: "10.0.0.1".parse().unwrap(),
            headers: &empty,
        };
        for _ in 0..3 {
            assert_eq!(
                limiter.check_at("r", &policy, &anonymous, at(0)),
                RateLimitDecision::Allowed
            );
        }

        let mut keyed = HeaderMap::new();
        keyed.insert("x-api-key", HeaderValue::from_static("k1"));
        let ctx = DescriptorContext {
            remote_address: "10.0.0.1".parse().unwrap(),
            headers: &keyed,
        };
        assert_eq!(limiter.check_at("r", &policy, &ctx, at(0)), RateLimitDecision::Allowed);
        assert!(matches!(
            limiter.check_at("r", &policy, &ctx, at(1)),
            RateLimitDecision::Limited { .. }
        ));
    }

    #[test]
    fn test_capacity_bounds_counters() {
        let limiter = RateLimiter::with_capacity(2);
        let headers = HeaderMap::new();
        let policy = policy(Descriptor::RemoteAddress, 10);
        for i in 1..=5u8 {
            let ctx = DescriptorContext {
                remote_address: IpAddr::from([10, 0, 0, i]),
                headers: &headers,
            };
            limiter.check_at("r", &policy, &ctx, at(0));
        }
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_limited_response() {
        let response = RateLimiter::limited_response(Duration::from_millis(200));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RATE_LIMITED_HEADER], "true");
        assert_eq!(response.headers()[RETRY_AFTER], "1");
    }
}
