//! Response types and HATEOAS structures for the Admin API.

use crate::config::Protocol;
use crate::forward::{ForwardError, ListFilter, Rule, RuleId, RuleState, RuleStatsSnapshot};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;

/// Default and maximum page sizes for `GET /forwards`
pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// HATEOAS link structure
#[derive(Debug, Serialize, Clone)]
pub struct Link {
    pub href: String,
}

/// HATEOAS links for rule resources
#[derive(Debug, Serialize, Clone)]
pub struct RuleLinks {
    #[serde(rename = "self")]
    pub self_link: Link,
    pub start: Link,
    pub stop: Link,
    pub stats: Link,
}

/// Rule summary for list responses
#[derive(Debug, Serialize)]
pub struct RuleSummary {
    #[serde(flatten)]
    pub rule: Rule,
    #[serde(rename = "_links")]
    pub links: RuleLinks,
}

/// Detailed rule response with its current statistics
#[derive(Debug, Serialize)]
pub struct RuleDetail {
    #[serde(flatten)]
    pub rule: Rule,
    pub stats: RuleStatsSnapshot,
    #[serde(rename = "_links")]
    pub links: RuleLinks,
}

/// Response for listing rules
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRulesResponse {
    pub items: Vec<RuleSummary>,
    /// Number of matching rules before pagination
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorDetail>,
}

/// Individual error detail
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Query parameters for `GET /forwards`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: ListFilter,
    pub page: usize,
    pub page_size: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: ListFilter::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ListQuery {
    /// Parse query parameters from query string
    pub fn parse(query: Option<&str>) -> Result<Self, String> {
        let mut params = Self::default();
        let Some(query) = query else {
            return Ok(params);
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(&raw.replace('+', " "))
                .map_err(|e| format!("Invalid value for '{key}': {e}"))?
                .into_owned();
            if value.is_empty() {
                continue;
            }

            match key {
                "status" => params.filter.state = Some(RuleState::parse(&value)?),
                "protocol" => params.filter.protocol = Some(Protocol::parse(&value)?),
                "keyword" => params.filter.keyword = Some(value),
                "page" => {
                    params.page = value
                        .parse()
                        .ok()
                        .filter(|p| *p >= 1)
                        .ok_or_else(|| format!("Invalid page: {value}"))?;
                }
                "pageSize" => {
                    params.page_size = value
                        .parse()
                        .ok()
                        .filter(|s| (1..=MAX_PAGE_SIZE).contains(s))
                        .ok_or_else(|| {
                            format!("Invalid pageSize: {value} (expected 1..={MAX_PAGE_SIZE})")
                        })?;
                }
                _ => {}
            }
        }
        Ok(params)
    }

    /// Apply pagination to an already filtered list
    pub fn paginate(&self, rules: Vec<Rule>) -> Vec<Rule> {
        rules
            .into_iter()
            .skip((self.page - 1).saturating_mul(self.page_size))
            .take(self.page_size)
            .collect()
    }
}

// =============================================================================
// Helper functions for generating HATEOAS links
// =============================================================================

/// Extract base URL from request headers for HATEOAS links
pub fn get_base_url(req: &Request<Incoming>) -> String {
    if let Some(host) = req.headers().get("host") {
        if let Ok(host_str) = host.to_str() {
            return format!("http://{}", host_str);
        }
    }
    "http://localhost:2480".to_string()
}

/// Generate HATEOAS links for a rule
pub fn make_rule_links(base_url: &str, id: RuleId) -> RuleLinks {
    let href = |suffix: &str| Link {
        href: format!("{}/forwards/{}{}", base_url, id, suffix),
    };
    RuleLinks {
        self_link: href(""),
        start: href("/start"),
        stop: href("/stop"),
        stats: href("/stats"),
    }
}

// =============================================================================
// Response helper functions
// =============================================================================

/// Create a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string_pretty(body).unwrap_or_else(|_| "{}".to_string());
    build_response_with_headers(status, [("Content-Type", "application/json")], json)
}

/// Build an HTTP response with the given status and body.
pub fn build_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}

/// Build an HTTP response with headers.
pub fn build_response_with_headers(
    status: StatusCode,
    headers: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (key, value) in headers {
        builder = builder.header(key.as_ref(), value.as_ref());
    }
    builder
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}

/// Create an error response
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
    let error = ErrorResponse {
        errors: vec![ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
        }],
    };
    json_response(status, &error)
}

/// Map an engine error to its HTTP status and machine-readable kind
pub fn forward_error_response(e: &ForwardError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, e.kind(), &e.to_string())
}

/// Create a not found response
pub fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "not_found", "Not Found")
}

/// Create a method not allowed response
pub fn method_not_allowed() -> Response<Full<Bytes>> {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "Method Not Allowed",
    )
}

/// Collect request body into bytes
pub async fn collect_body(req: Request<Incoming>) -> Result<Bytes, String> {
    use http_body_util::BodyExt;
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| format!("Failed to read request body: {e}"))
}
