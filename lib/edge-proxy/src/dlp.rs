//! Data loss prevention
//!
//! Masks sensitive data in response bodies and access log lines. Each
//! action compiles to a list of regexes; for every match the selected
//! capture group is masked from the left, `percent` of its characters
//! rounded up, with `mask_char`.

use crate::router::{CompiledMatcher, RequestInfo};
use crate::Result;
use edge_api::v1::options::dlp::{CustomAction, RegexAction};
use edge_api::v1::options::{DlpAction, DlpActionType, DlpRules, EnabledFor};
use regex::Regex;
use std::borrow::Cow;
use tracing::{debug, info};

const DEFAULT_MASK_CHAR: char = 'X';
const DEFAULT_PERCENT: f64 = 75.0;

/// (regex, capture group) pairs of the predefined actions
fn predefined(action: DlpActionType) -> Vec<(&'static str, usize)> {
    const VISA: &str = r"(?:^|\D)(4\d{3}[- ]?(?:\d{4}[- ]?){2}\d{4})(?:\D|$)";
    const MASTERCARD: &str = r"(?:^|\D)(5[1-5]\d{2}[- ]?(?:\d{4}[- ]?){2}\d{4})(?:\D|$)";
    const AMEX: &str = r"(?:^|\D)(3[47]\d{2}[- ]?\d{6}[- ]?\d{5})(?:\D|$)";
    const DISCOVER: &str = r"(?:^|\D)(6(?:011|5\d{2})[- ]?(?:\d{4}[- ]?){2}\d{4})(?:\D|$)";
    const JCB: &str = r"(?:^|\D)(35\d{2}[- ]?(?:\d{4}[- ]?){2}\d{4})(?:\D|$)";
    const DINERS: &str = r"(?:^|\D)(3(?:0[0-5]|[68]\d)\d[- ]?\d{6}[- ]?\d{4})(?:\D|$)";

    match action {
        DlpActionType::Custom => vec![],
        DlpActionType::Ssn => vec![
            (r"(?:^|\D)(\d{3}-\d{2}-\d{4})(?:\D|$)", 1),
            (r"(?:^|\D)(\d{9})(?:\D|$)", 1),
        ],
        DlpActionType::Visa => vec![(VISA, 1)],
        DlpActionType::Mastercard => vec![(MASTERCARD, 1)],
        DlpActionType::Amex => vec![(AMEX, 1)],
        DlpActionType::Discover => vec![(DISCOVER, 1)],
        DlpActionType::Jcb => vec![(JCB, 1)],
        DlpActionType::DinersClub => vec![(DINERS, 1)],
        DlpActionType::CreditCardTrackers => vec![
            (r"%?[Bb]\d{13,19}\^[-/.\w\s]{2,26}\^\d{7}\d*\??", 0),
            (r";?\d{13,19}=\d{7}\d*\??", 0),
        ],
        DlpActionType::AllCreditCards => vec![
            (VISA, 1),
            (MASTERCARD, 1),
            (AMEX, 1),
            (DISCOVER, 1),
            (JCB, 1),
            (DINERS, 1),
        ],
    }
}

#[derive(Debug)]
struct CompiledAction {
    name: String,
    patterns: Vec<(Regex, usize)>,
    mask_char: char,
    percent: f64,
    shadow: bool,
}

impl CompiledAction {
    fn new(action: &DlpAction) -> Result<Self> {
        let (name, patterns, mask_char, percent) = match (&action.action_type, &action.custom_action) {
            (DlpActionType::Custom, Some(custom)) => {
                let CustomAction {
                    name,
                    regex,
                    regex_actions,
                    mask_char,
                    percent,
                } = custom;
                let mut patterns = regex
                    .iter()
                    .map(|r| Ok((Regex::new(r)?, 0)))
                    .collect::<Result<Vec<_>>>()?;
                for RegexAction { regex, subgroup } in regex_actions {
                    patterns.push((Regex::new(regex)?, *subgroup));
                }
                let mask_char = mask_char.chars().next().unwrap_or(DEFAULT_MASK_CHAR);
                (name.clone(), patterns, mask_char, *percent)
            }
            (DlpActionType::Custom, None) => {
                return Err(crate::ProxyError::InvalidConfiguration(
                    "custom DLP action without custom_action".into(),
                ))
            }
            (predefined_type, _) => {
                let patterns = predefined(*predefined_type)
                    .into_iter()
                    .map(|(r, group)| Ok((Regex::new(r)?, group)))
                    .collect::<Result<Vec<_>>>()?;
                (
                    format!("{:?}", predefined_type),
                    patterns,
                    DEFAULT_MASK_CHAR,
                    DEFAULT_PERCENT,
                )
            }
        };
        Ok(Self {
            name,
            patterns,
            mask_char,
            percent: percent.clamp(0.0, 100.0),
            shadow: action.shadow,
        })
    }

    /// Byte ranges of every match of every pattern
    fn ranges(&self, input: &str) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        for (re, group) in &self.patterns {
            for caps in re.captures_iter(input) {
                if let Some(m) = caps.get(*group) {
                    ranges.push((m.start(), m.end()));
                }
            }
        }
        ranges
    }
}

/// Mask the leftmost `percent` of `text`, rounding up
pub fn mask(text: &str, mask_char: char, percent: f64) -> String {
    let len = text.chars().count();
    let masked = ((len as f64) * percent / 100.0).ceil() as usize;
    text.chars()
        .enumerate()
        .map(|(i, c)| if i < masked.min(len) { mask_char } else { c })
        .collect()
}

/// Sorted union of possibly overlapping byte ranges
fn merge_ranges(mut ranges: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    ranges.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start < last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Compiled set of DLP actions
#[derive(Debug)]
pub struct DlpMasker {
    actions: Vec<CompiledAction>,
    enabled_for: EnabledFor,
}

impl DlpMasker {
    pub fn new(actions: &[DlpAction], enabled_for: EnabledFor) -> Result<Self> {
        Ok(Self {
            actions: actions.iter().map(CompiledAction::new).collect::<Result<Vec<_>>>()?,
            enabled_for,
        })
    }

    pub fn applies_to_body(&self) -> bool {
        self.enabled_for.response_body()
    }

    pub fn applies_to_access_logs(&self) -> bool {
        self.enabled_for.access_logs()
    }

    /// Apply every action in order; shadow actions only log what they match
    pub fn mask<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut output = Cow::Borrowed(input);
        for action in &self.actions {
            let ranges = action.ranges(&output);
            if ranges.is_empty() {
                continue;
            }
            if action.shadow {
                info!(action = %action.name, matches = ranges.len(), "DLP shadow action matched");
                continue;
            }
            debug!(action = %action.name, matches = ranges.len(), "DLP masking");
            let mut text = output.into_owned();
            // apply from the right so earlier byte offsets stay valid
            for (start, end) in merge_ranges(ranges).into_iter().rev() {
                let masked = mask(&text[start..end], action.mask_char, action.percent);
                text.replace_range(start..end, &masked);
            }
            output = Cow::Owned(text);
        }
        output
    }

    /// Mask a body when it is UTF-8; binary bodies are left alone
    pub fn mask_bytes(&self, body: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(body).ok()?;
        match self.mask(text) {
            Cow::Borrowed(_) => None,
            Cow::Owned(masked) => Some(masked),
        }
    }
}

/// Listener-wide DLP rules, consulted when a route carries no DLP of its own
pub struct ListenerDlp {
    rules: Vec<(Option<CompiledMatcher>, DlpMasker)>,
}

impl ListenerDlp {
    pub fn new(rules: &DlpRules) -> Result<Self> {
        let rules = rules
            .dlp_rules
            .iter()
            .map(|rule| {
                let matcher = rule.matcher.as_ref().map(CompiledMatcher::new).transpose()?;
                Ok((matcher, DlpMasker::new(&rule.actions, rules.enabled_for)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// First rule whose matcher accepts the request
    pub fn for_request(&self, req: &RequestInfo<'_>) -> Option<&DlpMasker> {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.as_ref().map_or(true, |m| m.matches(req)))
            .map(|(_, masker)| masker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::v1::options::DlpRule;
    use edge_api::v1::proxy::Matcher;
    use hyper::{HeaderMap, Method};

    fn action(action_type: DlpActionType) -> DlpAction {
        DlpAction {
            action_type,
            custom_action: None,
            shadow: false,
        }
    }

    #[test]
    fn test_mask_rounds_up_from_left() {
        assert_eq!(mask("1234", 'X', 75.0), "XXX4");
        assert_eq!(mask("12345", 'X', 75.0), "XXXX5");
        assert_eq!(mask("123", '#', 50.0), "##3");
        assert_eq!(mask("abc", 'X', 100.0), "XXX");
        assert_eq!(mask("abc", 'X', 0.0), "abc");
    }

    #[test]
    fn test_ssn_masked() {
        let masker = DlpMasker::new(&[action(DlpActionType::Ssn)], EnabledFor::All).unwrap();
        assert_eq!(
            masker.mask("ssn: 123-45-6789."),
            "ssn: XXXXXXXXX89."
        );
        assert_eq!(masker.mask("no numbers here"), "no numbers here");
    }

    #[test]
    fn test_all_credit_cards() {
        let masker =
            DlpMasker::new(&[action(DlpActionType::AllCreditCards)], EnabledFor::ResponseBody)
                .unwrap();
        let masked = masker.mask(r#"{"visa":"4111111111111111","amex":"378282246310005"}"#);
        assert_eq!(
            masked,
            r#"{"visa":"XXXXXXXXXXXX1111","amex":"XXXXXXXXXXXX005"}"#
        );
        assert!(masker.applies_to_body());
        assert!(!masker.applies_to_access_logs());
    }

    #[test]
    fn test_custom_action_with_subgroup() {
        let custom = DlpAction {
            action_type: DlpActionType::Custom,
            custom_action: Some(CustomAction {
                name: "token".into(),
                regex: vec![],
                regex_actions: vec![RegexAction {
                    regex: r"token=([a-z0-9]+)".into(),
                    subgroup: 1,
                }],
                mask_char: "*".into(),
                percent: 50.0,
            }),
            shadow: false,
        };
        let masker = DlpMasker::new(&[custom], EnabledFor::AccessLogs).unwrap();
        assert_eq!(masker.mask("GET /?token=abcd1234"), "GET /?token=****1234");
    }

    #[test]
    fn test_overlapping_matches_masked_once() {
        let custom = DlpAction {
            action_type: DlpActionType::Custom,
            custom_action: Some(CustomAction {
                name: "account".into(),
                regex: vec![r"\d{4}-\d{4}".into(), r"\d{4}".into()],
                regex_actions: vec![],
                mask_char: "•".into(),
                percent: 100.0,
            }),
            shadow: false,
        };
        let masker = DlpMasker::new(&[custom], EnabledFor::All).unwrap();
        assert_eq!(masker.mask("acct 1234-5678 end"), "acct ••••••••• end");
        assert_eq!(merge_ranges(vec![(10, 14), (5, 14), (5, 9), (20, 22)]), vec![(5, 14), (20, 22)]);
    }

    #[test]
    fn test_shadow_only_logs() {
        let mut shadow = action(DlpActionType::Ssn);
        shadow.shadow = true;
        let masker = DlpMasker::new(&[shadow], EnabledFor::All).unwrap();
        assert!(matches!(masker.mask("123-45-6789"), Cow::Borrowed(_)));
        assert!(masker.mask_bytes(b"123-45-6789").is_none());
    }

    #[test]
    fn test_custom_without_config_is_rejected() {
        assert!(DlpMasker::new(&[action(DlpActionType::Custom)], EnabledFor::All).is_err());
    }

    #[test]
    fn test_listener_rules_by_matcher() {
        let rules = DlpRules {
            dlp_rules: vec![
                DlpRule {
                    matcher: Some(Matcher::prefix("/payments")),
                    actions: vec![action(DlpActionType::AllCreditCards)],
                },
                DlpRule {
                    matcher: None,
                    actions: vec![action(DlpActionType::Ssn)],
                },
            ],
            enabled_for: EnabledFor::ResponseBody,
        };
        let dlp = ListenerDlp::new(&rules).unwrap();
        let headers = HeaderMap::new();
        let info = |path| RequestInfo {
            authority: "example.com",
            path,
            query: None,
            method: &Method::GET,
            headers: &headers,
        };

        let payments = dlp.for_request(&info("/payments/1")).unwrap();
        assert_eq!(payments.mask("4111111111111111"), "XXXXXXXXXXXX1111");

        let other = dlp.for_request(&info("/users")).unwrap();
        assert_eq!(other.mask("4111111111111111"), "4111111111111111");
        assert_eq!(other.mask("123-45-6789"), "XXXXXXXXX89");
    }
}
