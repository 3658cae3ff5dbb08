//! Route dispatch logic for the Admin API.

use crate::admin_api::handlers::{forwards, system};
use crate::admin_api::types::{error_response, get_base_url, method_not_allowed, not_found};
use crate::forward::{RuleId, Supervisor};
use crate::metrics;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Parsed route for rule-specific endpoints
#[derive(Debug, PartialEq, Eq)]
enum ForwardRoute {
    /// GET/PUT/DELETE /forwards/:id
    Root,
    /// POST /forwards/:id/start
    Start,
    /// POST /forwards/:id/stop
    Stop,
    /// GET /forwards/:id/stats
    Stats,
    /// POST /forwards/:id/stats/reset
    ResetStats,
}

impl ForwardRoute {
    /// Parse route from path segments after `/forwards/:id`
    fn parse(segments: &[&str]) -> Option<Self> {
        match segments {
            [] | [""] => Some(ForwardRoute::Root),
            ["start"] => Some(ForwardRoute::Start),
            ["stop"] => Some(ForwardRoute::Stop),
            ["stats"] => Some(ForwardRoute::Stats),
            ["stats", "reset"] => Some(ForwardRoute::ResetStats),
            _ => None,
        }
    }
}

/// Main request router
pub async fn route_request(
    req: Request<Incoming>,
    supervisor: Arc<Supervisor>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|s| s.to_string());
    let base_url = get_base_url(&req);

    debug!("Admin API: {} {}", method, path);

    let response = route_by_path(&method, &path, query.as_deref(), req, &base_url, supervisor).await;
    metrics::record_request(method.as_str(), response.status().as_u16());
    Ok(response)
}

/// Route based on path
async fn route_by_path(
    method: &Method,
    path: &str,
    query: Option<&str>,
    req: Request<Incoming>,
    base_url: &str,
    supervisor: Arc<Supervisor>,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/") => return system::handle_root(base_url),
        (&Method::GET, "/health") => return system::handle_health(),
        (&Method::GET, "/metrics") => return system::handle_metrics(),
        _ => {}
    }

    // Rule collection routes
    match path {
        "/forwards" | "/forwards/" => {
            return match *method {
                Method::GET => forwards::handle_list(supervisor, query, base_url),
                Method::POST => forwards::handle_create(req, base_url, supervisor).await,
                _ => method_not_allowed(),
            };
        }
        "/forwards/stats" => {
            return match *method {
                Method::GET => forwards::handle_aggregate_stats(supervisor),
                _ => method_not_allowed(),
            };
        }
        _ => {}
    }

    // Individual rule routes
    if let Some(rest) = path.strip_prefix("/forwards/") {
        return route_forward(method, rest, req, base_url, supervisor).await;
    }

    not_found()
}

/// Route rule-specific requests
async fn route_forward(
    method: &Method,
    path: &str,
    req: Request<Incoming>,
    base_url: &str,
    supervisor: Arc<Supervisor>,
) -> Response<Full<Bytes>> {
    // Parse: id/remaining/path
    let segments: Vec<&str> = path.split('/').collect();

    let id: RuleId = match segments[0].parse() {
        Ok(id) => id,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "bad_request", "Invalid rule id")
        }
    };

    let route = match ForwardRoute::parse(&segments[1..]) {
        Some(r) => r,
        None => return not_found(),
    };

    match (method, route) {
        // /forwards/:id
        (&Method::GET, ForwardRoute::Root) => forwards::handle_get(id, base_url, supervisor),
        (&Method::PUT, ForwardRoute::Root) => {
            forwards::handle_update(id, req, base_url, supervisor).await
        }
        (&Method::DELETE, ForwardRoute::Root) => forwards::handle_delete(id, supervisor).await,

        // /forwards/:id/start, /forwards/:id/stop
        (&Method::POST, ForwardRoute::Start) => {
            forwards::handle_start(id, base_url, supervisor).await
        }
        (&Method::POST, ForwardRoute::Stop) => forwards::handle_stop(id, base_url, supervisor).await,

        // /forwards/:id/stats
        (&Method::GET, ForwardRoute::Stats) => forwards::handle_stats(id, supervisor),
        (&Method::POST, ForwardRoute::ResetStats) => forwards::handle_reset_stats(id, supervisor),

        _ => method_not_allowed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_route_parse() {
        assert_eq!(ForwardRoute::parse(&[]), Some(ForwardRoute::Root));
        assert_eq!(ForwardRoute::parse(&[""]), Some(ForwardRoute::Root));
        assert_eq!(ForwardRoute::parse(&["start"]), Some(ForwardRoute::Start));
        assert_eq!(ForwardRoute::parse(&["stop"]), Some(ForwardRoute::Stop));
        assert_eq!(ForwardRoute::parse(&["stats"]), Some(ForwardRoute::Stats));
        assert_eq!(
            ForwardRoute::parse(&["stats", "reset"]),
            Some(ForwardRoute::ResetStats)
        );

        // Invalid routes
        assert_eq!(ForwardRoute::parse(&["restart"]), None);
        assert_eq!(ForwardRoute::parse(&["stats", "clear"]), None);
    }
}
