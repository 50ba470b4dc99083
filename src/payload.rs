//! Action identity, upstream envelope unwrapping, and the empty-value policy
//! that gates every cache and store write.
//!
//! Upstream responses arrive wrapped: a list action's payload sits at
//! `data.<action>List.data.list`, a trend payload at
//! `data.industryTrendRange.data`, and so on. This module walks those known
//! unwrapping chains once so the rest of the crate only ever sees a
//! `serde_json::Value` that is already known to be present and non-empty,
//! or an explicit [`EmptyReason`] explaining why it wasn't stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A coarse request kind. `cat_id` is required for all but the two view
/// actions, which may be queried with an empty `cat_id` (site-wide).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    High,
    Hot,
    Chance,
    IndustryViewV2,
    IndustryTrendRange,
}

impl Action {
    pub fn parse(raw: &str) -> Option<Action> {
        match raw {
            "high" => Some(Action::High),
            "hot" => Some(Action::Hot),
            "chance" => Some(Action::Chance),
            "industryViewV2" => Some(Action::IndustryViewV2),
            "industryTrendRange" => Some(Action::IndustryTrendRange),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::High => "high",
            Action::Hot => "hot",
            Action::Chance => "chance",
            Action::IndustryViewV2 => "industryViewV2",
            Action::IndustryTrendRange => "industryTrendRange",
        }
    }

    pub fn is_trend(self) -> bool {
        matches!(self, Action::IndustryTrendRange)
    }

    /// The upstream envelope key wrapping this action's payload, e.g.
    /// `highList` for `Action::High`.
    fn envelope_key(self) -> &'static str {
        match self {
            Action::High => "highList",
            Action::Hot => "hotList",
            Action::Chance => "chanceList",
            Action::IndustryViewV2 => "industryViewV2",
            Action::IndustryTrendRange => "industryTrendRange",
        }
    }

    /// Whether this action's envelope carries `data.list` (vs. a bare object).
    fn is_list_shaped(self) -> bool {
        matches!(self, Action::High | Action::Hot | Action::Chance)
    }
}

/// Why a candidate result was refused a cache/store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    NonZeroCode,
    MissingData,
    EmptyList,
    NoTrendPoints,
    EmptyObject,
}

/// Unwrap the action-specific envelope out of a raw upstream response body,
/// returning the inner `data` value on success.
///
/// Mirrors the original's `_unwrap_result_data`: the envelope may sit at the
/// top level or nested one level under `resultData`/`data`/`self`.
pub fn unwrap_envelope(action: Action, raw: &Value) -> Option<Value> {
    if let Some(env) = raw.get(action.envelope_key()) {
        return Some(env.clone());
    }
    for wrapper_key in ["resultData", "data", "self"] {
        if let Some(env) = raw.get(wrapper_key).and_then(|w| w.get(action.envelope_key())) {
            return Some(env.clone());
        }
    }
    None
}

/// Apply the empty-value policy (`spec.md` §4.1, resolved concretely in
/// `SPEC_FULL.md` §4.1) to an already-unwrapped envelope.
///
/// Returns `Ok(data)` with the payload worth persisting, or `Err(reason)`.
pub fn check_not_empty(action: Action, envelope: &Value) -> Result<Value, EmptyReason> {
    if let Some(code) = envelope.get("code").and_then(Value::as_i64) {
        if code != 0 {
            return Err(EmptyReason::NonZeroCode);
        }
    }

    let data = match envelope.get("data") {
        Some(Value::Null) | None => return Err(EmptyReason::MissingData),
        Some(d) => d.clone(),
    };

    if action.is_list_shaped() {
        let list_len = data.get("list").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
        if list_len == 0 {
            return Err(EmptyReason::EmptyList);
        }
    } else if action.is_trend() {
        let points = data
            .get("industryTrendRange")
            .and_then(|v| v.get("data"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if points == 0 {
            return Err(EmptyReason::NoTrendPoints);
        }
    } else if data.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        return Err(EmptyReason::EmptyObject);
    }

    Ok(data)
}

/// Number of trend points an `industryTrendRange` result carries, used by
/// the scheduler's target-date logic and partial-merge accounting.
pub fn trend_point_count(data: &Value) -> usize {
    data.get("industryTrendRange")
        .and_then(|v| v.get("data"))
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

/// Stable digest over a request's extra parameters, used as a secondary key
/// (`params_hash`) so a document produced from different caller-supplied
/// filters is never mistaken for a cache hit on the identity tuple alone.
pub fn params_hash(extra: Option<&Value>) -> Option<String> {
    let extra = extra?;
    if extra.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        return None;
    }
    // `to_string` on serde_json::Value is stable for a given structural
    // value as long as key order is preserved; Value uses an ordered map
    // under the `preserve_order` feature-equivalent default (BTreeMap-like
    // for our purposes since callers always build `extra` the same way).
    let canonical = serde_json::to_string(extra).unwrap_or_default();
    Some(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_top_level_envelope() {
        let raw = json!({ "highList": { "code": 0, "data": { "list": [1] } } });
        let env = unwrap_envelope(Action::High, &raw).unwrap();
        assert_eq!(check_not_empty(Action::High, &env).unwrap()["list"], json!([1]));
    }

    #[test]
    fn unwraps_nested_result_data() {
        let raw = json!({ "resultData": { "highList": { "code": 0, "data": { "list": [1] } } } });
        let env = unwrap_envelope(Action::High, &raw).unwrap();
        assert!(check_not_empty(Action::High, &env).is_ok());
    }

    #[test]
    fn empty_list_is_rejected() {
        let raw = json!({ "hotList": { "code": 0, "data": { "list": [] } } });
        let env = unwrap_envelope(Action::Hot, &raw).unwrap();
        assert_eq!(check_not_empty(Action::Hot, &env), Err(EmptyReason::EmptyList));
    }

    #[test]
    fn nonzero_code_is_rejected_before_data_check() {
        let raw = json!({ "chanceList": { "code": 7, "data": { "list": [1] } } });
        let env = unwrap_envelope(Action::Chance, &raw).unwrap();
        assert_eq!(check_not_empty(Action::Chance, &env), Err(EmptyReason::NonZeroCode));
    }

    #[test]
    fn trend_with_zero_points_is_rejected() {
        let raw = json!({ "industryTrendRange": { "code": 0, "data": { "industryTrendRange": { "data": [] } } } });
        let env = unwrap_envelope(Action::IndustryTrendRange, &raw).unwrap();
        assert_eq!(check_not_empty(Action::IndustryTrendRange, &env), Err(EmptyReason::NoTrendPoints));
    }

    #[test]
    fn params_hash_is_none_for_empty_extra() {
        assert!(params_hash(None).is_none());
        assert!(params_hash(Some(&json!({}))).is_none());
        assert!(params_hash(Some(&json!({"region": "east"}))).is_some());
    }
}
