//! Data loss prevention options
//!
//! DLP masks sensitive data in response bodies and access logs. Actions
//! are either one of the predefined patterns or a custom set of regexes.

use crate::v1::proxy::Matcher;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DLP for a virtual host or route
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DlpConfig {
    #[serde(default)]
    pub actions: Vec<DlpAction>,

    #[serde(default)]
    pub enabled_for: EnabledFor,
}

/// Listener-wide DLP rules
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DlpRules {
    #[serde(default)]
    pub dlp_rules: Vec<DlpRule>,

    #[serde(default)]
    pub enabled_for: EnabledFor,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DlpRule {
    /// Requests this rule applies to; absent matches everything
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matcher: Option<Matcher>,

    #[serde(default)]
    pub actions: Vec<DlpAction>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnabledFor {
    #[default]
    ResponseBody,
    AccessLogs,
    All,
}

impl EnabledFor {
    pub fn response_body(&self) -> bool {
        matches!(self, EnabledFor::ResponseBody | EnabledFor::All)
    }

    pub fn access_logs(&self) -> bool {
        matches!(self, EnabledFor::AccessLogs | EnabledFor::All)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DlpAction {
    pub action_type: DlpActionType,

    /// Required when `action_type` is `CUSTOM`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_action: Option<CustomAction>,

    /// Only log matches, never mask
    #[serde(default)]
    pub shadow: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DlpActionType {
    Custom,
    Ssn,
    Mastercard,
    Visa,
    Amex,
    Discover,
    Jcb,
    DinersClub,
    CreditCardTrackers,
    AllCreditCards,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomAction {
    pub name: String,

    #[serde(default)]
    pub regex: Vec<String>,

    /// Regexes whose capture `subgroup` is masked instead of the whole match
    #[serde(default)]
    pub regex_actions: Vec<RegexAction>,

    #[serde(default = "default_mask_char")]
    pub mask_char: String,

    /// Percent of each match to mask, counted from the left
    #[serde(default = "default_percent")]
    pub percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegexAction {
    pub regex: String,

    #[serde(default)]
    pub subgroup: usize,
}

fn default_mask_char() -> String {
    "X".to_string()
}

fn default_percent() -> f64 {
    75.0
}
