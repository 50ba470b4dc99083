//! Parameter translation: identity-tuple fields to the upstream collect
//! API's `dateType`/`timest`/`starRange`/`endRange` shape (`spec.md` §4.2).

use serde_json::{json, Value};

use crate::payload::Action;
use crate::period::{self, Granularity};

use super::FetchRequest;

fn date_type_for(action: Action, granularity: Granularity) -> &'static str {
    // industryTrendRange uses the same QUARTERLY_FOR_YEAR convention as the
    // view actions at quarter granularity — resolved Open Question, see
    // SPEC_FULL.md §4.2.
    let _ = action;
    match granularity {
        Granularity::Day => "DAY",
        Granularity::Month => "MONTH",
        Granularity::Quarter => "QUARTERLY_FOR_YEAR",
        Granularity::Year => "YEAR",
    }
}

pub fn translate(req: &FetchRequest<'_>) -> Value {
    let mut params = json!({
        "catId": req.cat_id,
        "dateType": date_type_for(req.action, req.granularity),
    });

    if req.action.is_trend() {
        let (start, end) = caller_or_derived_range(req);
        params["timest"] = json!("");
        params["starRange"] = json!(start);
        params["endRange"] = json!(end);
    } else {
        params["timest"] = json!(period::format_for_collect_api(req.granularity, req.period_key));
        let (start, end) = caller_or_derived_range(req);
        params["starRange"] = json!(start);
        params["endRange"] = json!(end);
    }

    if let Some(extra) = req.extra {
        if let (Some(obj), Some(extra_obj)) = (params.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
    }

    params
}

/// If the caller supplied ISO-dated `starRange`/`endRange` in `extra`, keep
/// them; otherwise derive from the period's full date range (or, for
/// trends, format per-granularity as the collect API requires).
fn caller_or_derived_range(req: &FetchRequest<'_>) -> (String, String) {
    if let Some(extra) = req.extra {
        let start = extra.get("starRange").and_then(Value::as_str);
        let end = extra.get("endRange").and_then(Value::as_str);
        if let (Some(s), Some(e)) = (start, end) {
            return (s.to_string(), e.to_string());
        }
    }

    if req.action.is_trend() {
        period::format_trend_range(req.granularity, req.period_key, req.period_key)
    } else {
        period::period_to_date_range(req.granularity, req.period_key)
    }
}
