//! CORS filter

use crate::Result;
use edge_api::v1::options::CorsPolicy;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
};
use hyper::{Method, Response, StatusCode};
use regex::Regex;
use tracing::debug;

#[derive(Debug)]
pub struct CorsEvaluator {
    policy: CorsPolicy,
    origin_regexes: Vec<Regex>,
}

impl CorsEvaluator {
    pub fn new(policy: &CorsPolicy) -> Result<Self> {
        let origin_regexes = policy
            .allow_origin_regex
            .iter()
            .map(|r| Regex::new(&format!("^(?:{})$", r)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            policy: policy.clone(),
            origin_regexes,
        })
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.policy
            .allow_origin
            .iter()
            .any(|o| o == "*" || o == origin)
            || self.origin_regexes.iter().any(|re| re.is_match(origin))
    }

    /// `OPTIONS` carrying both `Origin` and `Access-Control-Request-Method`
    pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
        method == Method::OPTIONS
            && headers.contains_key(ORIGIN)
            && headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    /// Response to a preflight, or `None` when the origin is not allowed and
    /// the request continues upstream untouched
    pub fn preflight(&self, headers: &HeaderMap) -> Option<Response<Full<Bytes>>> {
        let origin = headers.get(ORIGIN)?.to_str().ok()?;
        if !self.is_origin_allowed(origin) {
            debug!(origin = %origin, "CORS preflight from disallowed origin");
            return None;
        }

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::NO_CONTENT;
        let out = response.headers_mut();
        self.insert_origin(out, origin);
        insert_list(out, ACCESS_CONTROL_ALLOW_METHODS, &self.policy.allow_methods);
        insert_list(out, ACCESS_CONTROL_ALLOW_HEADERS, &self.policy.allow_headers);
        if let Some(max_age) = self.policy.max_age {
            out.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(max_age));
        }
        Some(response)
    }

    /// Headers added to the response of an actual cross-origin request
    pub fn apply(&self, request_headers: &HeaderMap, response_headers: &mut HeaderMap) {
        let Some(origin) = request_headers.get(ORIGIN).and_then(|o| o.to_str().ok()) else {
            return;
        };
        if !self.is_origin_allowed(origin) {
            return;
        }
        self.insert_origin(response_headers, origin);
        insert_list(
            response_headers,
            ACCESS_CONTROL_EXPOSE_HEADERS,
            &self.policy.expose_headers,
        );
    }

    fn insert_origin(&self, headers: &mut HeaderMap, origin: &str) {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        if self.policy.allow_credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }
}

fn insert_list(headers: &mut HeaderMap, name: hyper::header::HeaderName, values: &[String]) {
    if values.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&values.join(",")) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CorsPolicy {
        CorsPolicy {
            allow_origin: vec!["https://app.example.com".into()],
            allow_origin_regex: vec![r"https://[a-z]+\.internal\.example\.com".into()],
            allow_methods: vec!["GET".into(), "POST".into()],
            allow_headers: vec!["content-type".into()],
            expose_headers: vec!["x-trace".into()],
            max_age: Some(600),
            allow_credentials: true,
            disable_for_route: false,
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_origin_matching() {
        let cors = CorsEvaluator::new(&policy()).unwrap();
        assert!(cors.is_origin_allowed("https://app.example.com"));
        assert!(cors.is_origin_allowed("https://billing.internal.example.com"));
        assert!(!cors.is_origin_allowed("https://evil.com"));
        assert!(!cors.is_origin_allowed("https://x.internal.example.com.evil.com"));
    }

    #[test]
    fn test_preflight() {
        let cors = CorsEvaluator::new(&policy()).unwrap();
        let request = headers(&[
            ("origin", "https://app.example.com"),
            ("access-control-request-method", "POST"),
        ]);
        assert!(CorsEvaluator::is_preflight(&Method::OPTIONS, &request));
        assert!(!CorsEvaluator::is_preflight(&Method::GET, &request));

        let response = cors.preflight(&request).unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let h = response.headers();
        assert_eq!(h[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example.com");
        assert_eq!(h[ACCESS_CONTROL_ALLOW_METHODS], "GET,POST");
        assert_eq!(h[ACCESS_CONTROL_ALLOW_HEADERS], "content-type");
        assert_eq!(h[ACCESS_CONTROL_MAX_AGE], "600");
        assert_eq!(h[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");

        let denied = headers(&[
            ("origin", "https://evil.com"),
            ("access-control-request-method", "POST"),
        ]);
        assert!(cors.preflight(&denied).is_none());
    }

    #[test]
    fn test_actual_request_headers() {
        let cors = CorsEvaluator::new(&policy()).unwrap();
        let mut response = HeaderMap::new();
        cors.apply(&headers(&[("origin", "https://app.example.com")]), &mut response);
        assert_eq!(response[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example.com");
        assert_eq!(response[ACCESS_CONTROL_EXPOSE_HEADERS], "x-trace");

        let mut untouched = HeaderMap::new();
        cors.apply(&HeaderMap::new(), &mut untouched);
        assert!(untouched.is_empty());
    }
}
