//! Parse the SSE endpoint's query-parameter surface into the engine's
//! typed request (spec.md §6 "Request surface").

use rsrch_protocol::{
    dedup_preserve_order, parse_boolish, ClientAttribution, IdentityScope, RequestParams,
};

/// Everything the query string carries, before it's turned into a task.
pub struct IncomingRequest {
    pub params: RequestParams,
    pub attribution: ClientAttribution,
    pub caller_task_id: Option<String>,
    pub force_restart: bool,
}

fn get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// URL wins over configured defaults, dedup preserves first-seen order
/// (spec.md §6). `merge_comma_lists` splits on `,` unconditionally, so an
/// empty `configured` string would otherwise contribute a spurious `""`
/// entry — filtered out here before the fallback ever reaches it.
fn merge_model_list(from_url: Option<&str>, configured: &str) -> Vec<String> {
    let configured_items: Vec<String> = configured
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    match from_url {
        Some(list) => dedup_preserve_order(
            list.split(',')
                .map(str::to_string)
                .chain(configured_items),
        ),
        None => dedup_preserve_order(configured_items),
    }
}

/// `url.parse()`'s `query_pairs()` already percent-decodes; this just
/// assembles the typed request from the decoded `(key, value)` pairs.
pub fn parse(
    pairs: &[(String, String)],
    configured_search_provider: &str,
    configured_thinking_models: &str,
    configured_task_models: &str,
) -> IncomingRequest {
    let mut params = RequestParams {
        query: get(pairs, "query").unwrap_or("").to_string(),
        search_provider: configured_search_provider.to_string(),
        ..RequestParams::default()
    };

    if let Some(language) = get(pairs, "language") {
        params.language = language.to_string();
    }
    if let Some(max_result) = get(pairs, "maxResult").and_then(|v| v.parse::<u32>().ok()) {
        params.max_result = max_result;
    }
    if let Some(flag) = get(pairs, "enableCitationImage") {
        params.enable_citation_image = parse_boolish(flag);
    }
    if let Some(flag) = get(pairs, "enableReferences") {
        params.enable_references = parse_boolish(flag);
    }

    params.thinking_models = merge_model_list(get(pairs, "thinkingModel"), configured_thinking_models);
    params.task_models = merge_model_list(get(pairs, "taskModel"), configured_task_models);

    params.identity = IdentityScope {
        user_id: get(pairs, "userId").map(str::to_string),
        topic_id: get(pairs, "topicId").map(str::to_string),
        mode: get(pairs, "mode").map(str::to_string),
        data_base_url: get(pairs, "dataBaseUrl").map(str::to_string),
    };

    let force_restart = get(pairs, "forceRestart")
        .or_else(|| get(pairs, "restart"))
        .map(|v| v != "false")
        .unwrap_or(false);

    let caller_task_id = get(pairs, "userMessageId").map(str::to_string);

    IncomingRequest {
        params,
        attribution: ClientAttribution::default(),
        caller_task_id,
        force_restart,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parse_with(pairs: &[(String, String)]) -> IncomingRequest {
        parse(pairs, "tavily", "", "")
    }

    #[test]
    fn defaults_apply_when_params_absent() {
        let req = parse_with(&pairs(&[]));
        assert_eq!(req.params.query, "");
        assert_eq!(req.params.language, "zh-CN");
        assert_eq!(req.params.max_result, 50);
        assert!(req.params.enable_citation_image);
        assert!(req.params.enable_references);
        assert!(!req.force_restart);
        assert_eq!(req.params.search_provider, "tavily");
        assert!(req.params.thinking_models.is_empty());
        assert!(req.params.task_models.is_empty());
    }

    #[test]
    fn boolish_false_disables_flags() {
        let req = parse_with(&pairs(&[
            ("enableCitationImage", "false"),
            ("enableReferences", "false"),
        ]));
        assert!(!req.params.enable_citation_image);
        assert!(!req.params.enable_references);
    }

    #[test]
    fn force_restart_accepts_either_alias() {
        assert!(parse_with(&pairs(&[("restart", "true")])).force_restart);
        assert!(parse_with(&pairs(&[("forceRestart", "1")])).force_restart);
        assert!(!parse_with(&pairs(&[("restart", "false")])).force_restart);
    }

    #[test]
    fn model_lists_dedup_and_preserve_order() {
        let req = parse_with(&pairs(&[("thinkingModel", "a,b,a,c")]));
        assert_eq!(req.params.thinking_models, vec!["a", "b", "c"]);
    }

    #[test]
    fn url_model_wins_over_configured_default_but_both_survive() {
        let req = parse(&pairs(&[("thinkingModel", "a,b")]), "tavily", "b,c", "");
        assert_eq!(req.params.thinking_models, vec!["a", "b", "c"]);
    }

    #[test]
    fn configured_default_applies_when_url_omits_the_param() {
        let req = parse(&pairs(&[]), "tavily", "configured-thinker", "configured-tasker");
        assert_eq!(req.params.thinking_models, vec!["configured-thinker"]);
        assert_eq!(req.params.task_models, vec!["configured-tasker"]);
    }

    #[test]
    fn identity_scope_fields_are_carried_through() {
        let req = parse_with(&pairs(&[
            ("userId", "u-1"),
            ("topicId", "t-1"),
            ("mode", "chat"),
        ]));
        assert_eq!(req.params.identity.user_id.as_deref(), Some("u-1"));
        assert_eq!(req.params.identity.topic_id.as_deref(), Some("t-1"));
        assert_eq!(req.params.identity.mode.as_deref(), Some("chat"));
    }

    #[test]
    fn caller_task_id_is_extracted_from_user_message_id() {
        let req = parse_with(&pairs(&[("userMessageId", "corr-1")]));
        assert_eq!(req.caller_task_id.as_deref(), Some("corr-1"));
    }
}
