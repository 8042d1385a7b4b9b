//! Request authentication
//!
//! A route with an auth policy reaches its upstream only when every check
//! accepts the request. Accepted requests carry the authenticated user in
//! `x-user-id` plus any headers taken from API key metadata.

use crate::error::ProxyError;
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use edge_api::xds::auth::{ApiKeyCheck, AuthCheck, AuthPolicy, BasicCheck, IntrospectionCheck};
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION};
use hyper::HeaderMap;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

pub const USER_ID_HEADER: &str = "x-user-id";

const INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// What the checks learned about the caller
#[derive(Debug, Default, PartialEq)]
pub struct Identity {
    pub user: Option<String>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl Identity {
    /// Replace any client supplied identity headers with the authenticated ones
    pub fn apply(self, headers: &mut HeaderMap) {
        headers.remove(USER_ID_HEADER);
        if let Some(value) = self.user.and_then(|u| HeaderValue::from_str(&u).ok()) {
            headers.insert(USER_ID_HEADER, value);
        }
        for (name, value) in self.headers {
            headers.insert(name, value);
        }
    }
}

pub struct Authenticator {
    client: reqwest::Client,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, policy: &AuthPolicy, headers: &HeaderMap) -> Result<Identity> {
        let mut identity = Identity::default();
        for check in &policy.checks {
            match check {
                AuthCheck::Basic(basic) => identity.user = Some(check_basic(basic, headers)?),
                AuthCheck::ApiKey(api_key) => {
                    let (user, extra) = check_api_key(api_key, headers)?;
                    identity.user = Some(user);
                    identity.headers.extend(extra);
                }
                AuthCheck::Introspection(introspection) => {
                    if let Some(user) = self.introspect(introspection, headers).await? {
                        identity.user = Some(user);
                    }
                }
            }
        }
        Ok(identity)
    }

    /// Active tokens yield the configured user id claim, if present
    async fn introspect(
        &self,
        check: &IntrospectionCheck,
        headers: &HeaderMap,
    ) -> Result<Option<String>> {
        let token = credentials(headers, "Bearer")
            .ok_or_else(|| ProxyError::Unauthorized("missing bearer token".into()))?;
        let claims = match self.token_claims(check, token).await {
            Ok(claims) => claims,
            Err(e) => {
                warn!(url = %check.url, error = %e, "Token introspection failed");
                return Err(ProxyError::Unauthorized("token introspection failed".into()));
            }
        };
        if claims.get("active").and_then(serde_json::Value::as_bool) != Some(true) {
            return Err(ProxyError::Unauthorized("token is not active".into()));
        }

        let user = check
            .user_id_attribute_name
            .as_deref()
            .and_then(|name| claims.get(name))
            .and_then(|claim| match claim {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        debug!(url = %check.url, user = ?user, "Token is active");
        Ok(user)
    }

    async fn token_claims(
        &self,
        check: &IntrospectionCheck,
        token: &str,
    ) -> reqwest::Result<serde_json::Value> {
        self.client
            .post(&check.url)
            .basic_auth(&check.client_id, Some(&check.client_secret))
            .form(&[("token", token), ("token_type_hint", "access_token")])
            .timeout(INTROSPECTION_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// `WWW-Authenticate` challenge sent with a denial
pub fn challenge(policy: &AuthPolicy) -> Option<HeaderValue> {
    policy.checks.iter().find_map(|check| match check {
        AuthCheck::Basic(basic) => {
            HeaderValue::from_str(&format!("Basic realm=\"{}\"", basic.realm)).ok()
        }
        _ => None,
    })
}

/// Credentials of an `Authorization` header with the given scheme
fn credentials<'a>(headers: &'a HeaderMap, scheme: &str) -> Option<&'a str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (found, credentials) = value.split_once(' ')?;
    found
        .eq_ignore_ascii_case(scheme)
        .then(|| credentials.trim())
        .filter(|c| !c.is_empty())
}

fn check_basic(check: &BasicCheck, headers: &HeaderMap) -> Result<String> {
    let denied = || ProxyError::Unauthorized("invalid basic credentials".into());
    let encoded = credentials(headers, "Basic")
        .ok_or_else(|| ProxyError::Unauthorized("missing basic credentials".into()))?;
    let decoded = STANDARD.decode(encoded).map_err(|_| denied())?;
    let decoded = String::from_utf8(decoded).map_err(|_| denied())?;
    let (user, password) = decoded.split_once(':').ok_or_else(denied)?;

    let stored = check.users.get(user).ok_or_else(denied)?;
    let hashed = hex::encode(Sha256::digest(format!("{}{}", stored.salt, password)));
    if !hashed.eq_ignore_ascii_case(&stored.hashed_password) {
        return Err(denied());
    }
    Ok(user.to_string())
}

fn check_api_key(
    check: &ApiKeyCheck,
    headers: &HeaderMap,
) -> Result<(String, Vec<(HeaderName, HeaderValue)>)> {
    let key = headers
        .get(check.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or_else(|| ProxyError::Unauthorized("missing API key".into()))?;
    let identity = check
        .keys
        .get(key)
        .ok_or_else(|| ProxyError::Unauthorized("unknown API key".into()))?;

    let mut extra = Vec::new();
    for (header, entry) in &check.headers_from_metadata {
        let Some(value) = identity.metadata.get(entry) else {
            continue;
        };
        match (HeaderName::try_from(header.as_str()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => extra.push((name, value)),
            _ => debug!(header = %header, "Skipping invalid metadata header"),
        }
    }
    Ok((identity.user.clone(), extra))
}
