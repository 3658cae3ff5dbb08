//! Forward rule CRUD, lifecycle and statistics handlers.

use crate::admin_api::types::*;
use crate::forward::{ForwardError, Rule, RuleConfig, RuleId, RuleUpdate, Supervisor};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Read and deserialize a JSON request body
async fn parse_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
    let body = collect_body(req)
        .await
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, "bad_request", &e))?;
    serde_json::from_slice(&body).map_err(|e| {
        forward_error_response(&ForwardError::InvalidConfig(format!("Invalid rule JSON: {e}")))
    })
}

fn summary(rule: Rule, base_url: &str) -> RuleSummary {
    let links = make_rule_links(base_url, rule.id);
    RuleSummary { rule, links }
}

fn detail(
    rule: Rule,
    supervisor: &Supervisor,
    base_url: &str,
) -> Result<RuleDetail, ForwardError> {
    let stats = supervisor.get_stats(rule.id)?;
    let links = make_rule_links(base_url, rule.id);
    Ok(RuleDetail { rule, stats, links })
}

/// Respond with the rule detail, or the error that prevented it
fn detail_response(
    status: StatusCode,
    result: Result<Rule, ForwardError>,
    supervisor: &Supervisor,
    base_url: &str,
) -> Response<Full<Bytes>> {
    match result.and_then(|rule| detail(rule, supervisor, base_url)) {
        Ok(detail) => json_response(status, &detail),
        Err(e) => forward_error_response(&e),
    }
}

/// GET /forwards - List rules
pub fn handle_list(
    supervisor: Arc<Supervisor>,
    query: Option<&str>,
    base_url: &str,
) -> Response<Full<Bytes>> {
    let params = match ListQuery::parse(query) {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "bad_request", &e),
    };

    let rules = supervisor.list(&params.filter);
    let total = rules.len();
    let items = params
        .paginate(rules)
        .into_iter()
        .map(|rule| summary(rule, base_url))
        .collect();

    json_response(
        StatusCode::OK,
        &ListRulesResponse {
            items,
            total,
            page: params.page,
            page_size: params.page_size,
        },
    )
}

/// POST /forwards - Create a rule
pub async fn handle_create(
    req: Request<Incoming>,
    base_url: &str,
    supervisor: Arc<Supervisor>,
) -> Response<Full<Bytes>> {
    let config: RuleConfig = match parse_json(req).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    detail_response(
        StatusCode::CREATED,
        supervisor.create(config),
        &supervisor,
        base_url,
    )
}

/// GET /forwards/:id - Rule detail
pub fn handle_get(id: RuleId, base_url: &str, supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    detail_response(StatusCode::OK, supervisor.get(id), &supervisor, base_url)
}

/// PUT /forwards/:id - Update a rule
pub async fn handle_update(
    id: RuleId,
    req: Request<Incoming>,
    base_url: &str,
    supervisor: Arc<Supervisor>,
) -> Response<Full<Bytes>> {
    let update: RuleUpdate = match parse_json(req).await {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let result = supervisor.update(id, &update).await;
    detail_response(StatusCode::OK, result, &supervisor, base_url)
}

/// DELETE /forwards/:id - Delete a rule
pub async fn handle_delete(id: RuleId, supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    match supervisor.delete(id).await {
        Ok(_) => build_response(StatusCode::NO_CONTENT, Bytes::new()),
        Err(e) => forward_error_response(&e),
    }
}

/// POST /forwards/:id/start - Start a rule
pub async fn handle_start(
    id: RuleId,
    base_url: &str,
    supervisor: Arc<Supervisor>,
) -> Response<Full<Bytes>> {
    let result = supervisor.start(id).await;
    detail_response(StatusCode::OK, result, &supervisor, base_url)
}

/// POST /forwards/:id/stop - Stop a rule
pub async fn handle_stop(
    id: RuleId,
    base_url: &str,
    supervisor: Arc<Supervisor>,
) -> Response<Full<Bytes>> {
    let result = supervisor.stop(id).await;
    detail_response(StatusCode::OK, result, &supervisor, base_url)
}

/// GET /forwards/stats - Aggregate statistics
pub fn handle_aggregate_stats(supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &supervisor.aggregate_stats())
}

/// GET /forwards/:id/stats - One rule's statistics
pub fn handle_stats(id: RuleId, supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    match supervisor.get_stats(id) {
        Ok(stats) => json_response(StatusCode::OK, &stats),
        Err(e) => forward_error_response(&e),
    }
}

/// POST /forwards/:id/stats/reset - Zero a rule's cumulative counters
pub fn handle_reset_stats(id: RuleId, supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    match supervisor.reset_stats(id) {
        Ok(stats) => json_response(StatusCode::OK, &stats),
        Err(e) => forward_error_response(&e),
    }
}
