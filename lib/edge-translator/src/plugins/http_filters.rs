//! CORS, DLP and rate-limit filters
//!
//! A filter is installed when any scope of the listener (the listener itself,
//! one of its virtual hosts or one of their routes) configures it.

use super::{HttpConnectionManagerPlugin, Params};
use crate::{Result, TranslateError};
use edge_api::v1::options::dlp::CustomAction;
use edge_api::v1::options::{DlpAction, DlpActionType, RateLimitPolicy};
use edge_api::v1::proxy::{HttpListener, Route, VirtualHost};
use edge_api::xds::{FilterStage, HttpConnectionManager, HttpFilter};
use regex::Regex;

pub const CORS_FILTER: &str = "cors";
pub const DLP_FILTER: &str = "dlp";
pub const RATE_LIMIT_FILTER: &str = "rate_limit";

fn any_scope(
    http: &HttpListener,
    virtual_host: impl Fn(&VirtualHost) -> bool,
    route: impl Fn(&Route) -> bool,
) -> bool {
    http.virtual_hosts
        .iter()
        .any(|vh| virtual_host(vh) || vh.routes.iter().any(&route))
}

fn push_filter(hcm: &mut HttpConnectionManager, name: &str, stage: FilterStage) {
    if !hcm.has_filter(name) {
        hcm.http_filters.push(HttpFilter {
            name: name.to_string(),
            stage,
        });
    }
}

pub struct CorsPlugin;

impl HttpConnectionManagerPlugin for CorsPlugin {
    fn name(&self) -> &'static str {
        CORS_FILTER
    }

    fn process_hcm(&self, _params: &Params<'_>, http: &HttpListener, hcm: &mut HttpConnectionManager) -> Result<()> {
        let enabled = http.options.cors.is_some()
            || any_scope(http, |vh| vh.options.cors.is_some(), |r| r.options.cors.is_some());
        if enabled {
            push_filter(hcm, CORS_FILTER, FilterStage::Cors);
        }
        Ok(())
    }
}

pub struct DlpPlugin;

impl HttpConnectionManagerPlugin for DlpPlugin {
    fn name(&self) -> &'static str {
        DLP_FILTER
    }

    fn process_hcm(&self, _params: &Params<'_>, http: &HttpListener, hcm: &mut HttpConnectionManager) -> Result<()> {
        if let Some(rules) = &http.options.dlp {
            for rule in &rules.dlp_rules {
                validate_actions(&rule.actions)?;
            }
            hcm.listener_dlp = Some(rules.clone());
        }
        for vh in &http.virtual_hosts {
            if let Some(dlp) = &vh.options.dlp {
                validate_actions(&dlp.actions)?;
            }
            for route in &vh.routes {
                if let Some(dlp) = &route.options.dlp {
                    validate_actions(&dlp.actions)?;
                }
            }
        }

        let enabled = http.options.dlp.is_some()
            || any_scope(http, |vh| vh.options.dlp.is_some(), |r| r.options.dlp.is_some());
        if enabled {
            push_filter(hcm, DLP_FILTER, FilterStage::WafStage);
        }
        Ok(())
    }
}

fn validate_actions(actions: &[DlpAction]) -> Result<()> {
    for action in actions {
        if action.action_type != DlpActionType::Custom {
            continue;
        }
        let custom = action.custom_action.as_ref().ok_or_else(|| {
            TranslateError::InvalidConfiguration("CUSTOM dlp action requires customAction".into())
        })?;
        validate_custom(custom)?;
    }
    Ok(())
}

fn validate_custom(custom: &CustomAction) -> Result<()> {
    let invalid = |msg: String| TranslateError::InvalidConfiguration(format!("dlp action {}: {}", custom.name, msg));

    if custom.regex.is_empty() && custom.regex_actions.is_empty() {
        return Err(invalid("no regex configured".into()));
    }
    if !(custom.percent > 0.0 && custom.percent <= 100.0) {
        return Err(invalid(format!("percent {} is not within (0, 100]", custom.percent)));
    }
    if custom.mask_char.chars().count() != 1 {
        return Err(invalid(format!("mask char {:?} must be a single character", custom.mask_char)));
    }
    for pattern in &custom.regex {
        Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
    }
    for action in &custom.regex_actions {
        let re = Regex::new(&action.regex).map_err(|e| invalid(e.to_string()))?;
        if action.subgroup >= re.captures_len() {
            return Err(invalid(format!("regex {} has no subgroup {}", action.regex, action.subgroup)));
        }
    }
    Ok(())
}

pub struct RateLimitPlugin;

impl HttpConnectionManagerPlugin for RateLimitPlugin {
    fn name(&self) -> &'static str {
        RATE_LIMIT_FILTER
    }

    fn process_hcm(&self, _params: &Params<'_>, http: &HttpListener, hcm: &mut HttpConnectionManager) -> Result<()> {
        let mut enabled = false;
        let scopes = http
            .options
            .rate_limit
            .iter()
            .chain(http.virtual_hosts.iter().flat_map(|vh| {
                vh.options
                    .rate_limit
                    .iter()
                    .chain(vh.routes.iter().filter_map(|r| r.options.rate_limit.as_ref()))
            }));
        for policy in scopes {
            validate_rate_limit(policy)?;
            enabled = true;
        }
        if enabled {
            push_filter(hcm, RATE_LIMIT_FILTER, FilterStage::RateLimit);
        }
        Ok(())
    }
}

fn validate_rate_limit(policy: &RateLimitPolicy) -> Result<()> {
    for rule in &policy.rules {
        if rule.requests_per_unit == 0 {
            return Err(TranslateError::InvalidConfiguration(format!(
                "rate limit rule {} allows zero requests per unit",
                rule.name
            )));
        }
    }
    Ok(())
}
