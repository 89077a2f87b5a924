//! Credit-gated tool invocation.
//!
//! Every namespaced call enters here. When the upstream exposes a `quote`
//! tool and the caller presented an API key, the call is priced before it
//! runs and reconciled with actuals after: quote, quota check, forward,
//! extract actuals, track. Callers without a key, routers without a
//! user-management service, and quote calls themselves all bypass pricing
//! and forward directly.

use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::model::CallToolResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::context::current_identity;
use crate::error::{RouterError, RouterResult};
use crate::upstream::{first_text, ConnectionManager};

/// Cost estimate returned by an upstream `quote` tool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuoteEstimate {
    pub model_id: Option<String>,
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: Option<i64>,
}

/// Token totals actually consumed by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actuals {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuotaRequest<'a> {
    api_key: &'a str,
    service: &'a str,
    model: Option<&'a str>,
    input_tokens: i64,
    output_tokens: i64,
}

/// Quota decision from the user-management service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(default)]
    pub remaining_daily: i64,
    #[serde(default)]
    pub remaining_monthly: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackRequest<'a> {
    api_key: &'a str,
    service: &'a str,
    model: Option<&'a str>,
    input_tokens: i64,
    output_tokens: i64,
    usage: i64,
    metadata: TrackMetadata<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackMetadata<'a> {
    tool_name: &'a str,
    duration: i64,
    success: bool,
    user_id: Option<&'a str>,
    user_email: Option<&'a str>,
    quoted_input_tokens: i64,
    quoted_output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
}

/// HTTP client for the external user-management service.
pub struct UserManagementClient {
    http: reqwest::Client,
    base_url: String,
    admin_key: String,
}

impl UserManagementClient {
    pub fn new(base_url: impl Into<String>, admin_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            admin_key: admin_key.into(),
        }
    }

    /// Check whether an API key is valid at all.
    pub async fn validate_key(&self, api_key: &str) -> Result<bool> {
        let response = self
            .http
            .post(format!("{}/keys/validate", self.base_url))
            .bearer_auth(&self.admin_key)
            .json(&json!({ "apiKey": api_key }))
            .send()
            .await
            .context("key validation request failed")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(false);
        }
        let body: ValidateResponse = response
            .error_for_status()
            .context("key validation rejected")?
            .json()
            .await
            .context("key validation response unparseable")?;
        Ok(body.valid)
    }

    /// Pre-check a quoted call against the caller's quota.
    pub async fn check_quota(
        &self,
        api_key: &str,
        service: &str,
        estimate: &QuoteEstimate,
    ) -> Result<QuotaDecision> {
        let request = QuotaRequest {
            api_key,
            service,
            model: estimate.model_id.as_deref(),
            input_tokens: estimate.input_tokens,
            output_tokens: estimate.output_tokens.unwrap_or(0),
        };
        let decision = self
            .http
            .post(format!("{}/usage/quota", self.base_url))
            .bearer_auth(&self.admin_key)
            .json(&request)
            .send()
            .await
            .context("quota request failed")?
            .error_for_status()
            .context("quota check rejected")?
            .json()
            .await
            .context("quota response unparseable")?;
        Ok(decision)
    }

    /// Record actual usage after a forwarded call. Best-effort.
    #[allow(clippy::too_many_arguments)]
    async fn track_usage(
        &self,
        api_key: &str,
        service: &str,
        tool_name: &str,
        estimate: &QuoteEstimate,
        actuals: Actuals,
        duration_ms: i64,
        success: bool,
        user_id: Option<&str>,
        user_email: Option<&str>,
    ) -> Result<()> {
        let request = TrackRequest {
            api_key,
            service,
            model: estimate.model_id.as_deref(),
            input_tokens: actuals.input_tokens,
            output_tokens: actuals.output_tokens,
            usage: actuals.input_tokens + actuals.output_tokens,
            metadata: TrackMetadata {
                tool_name,
                duration: duration_ms,
                success,
                user_id,
                user_email,
                quoted_input_tokens: estimate.input_tokens,
                quoted_output_tokens: estimate.output_tokens.unwrap_or(0),
            },
        };
        self.http
            .post(format!("{}/usage/track", self.base_url))
            .bearer_auth(&self.admin_key)
            .json(&request)
            .send()
            .await
            .context("track request failed")?
            .error_for_status()
            .context("track rejected")?;
        Ok(())
    }
}

/// The quote/quota/track pipeline wrapped around upstream forwarding.
pub struct CreditGate {
    manager: Arc<ConnectionManager>,
    client: Option<UserManagementClient>,
}

impl CreditGate {
    pub fn new(manager: Arc<ConnectionManager>, config: &RouterConfig) -> Self {
        let client = match (&config.user_management_api, &config.user_management_api_key) {
            (Some(api), Some(key)) => Some(UserManagementClient::new(api, key)),
            _ => None,
        };
        if client.is_none() {
            debug!("credit manager not configured; forwarding without quotas");
        }
        Self { manager, client }
    }

    /// Whether quota enforcement is active at all.
    pub fn enforcing(&self) -> bool {
        self.client.is_some()
    }

    /// Forward `server{sep}original` through the bypass matrix.
    pub async fn invoke(
        &self,
        server: &str,
        original: &str,
        args: Value,
    ) -> RouterResult<CallToolResult> {
        let namespaced = format!("{}{}{}", server, self.manager.separator(), original);
        let identity = current_identity();

        // Bypass matrix: quote calls, anonymous callers, and an absent
        // credit manager all skip pricing entirely.
        let client = match (&self.client, &identity.api_key) {
            (Some(client), Some(api_key)) if original != "quote" => (client, api_key.clone()),
            _ => return self.manager.call_tool(&namespaced, args).await,
        };
        let (client, api_key) = client;

        if !self.manager.has_quote_tool(server).await {
            // No quote tool upstream: validate the key, then forward
            // without pre-check or tracking.
            let valid = client
                .validate_key(&api_key)
                .await
                .map_err(RouterError::Internal)?;
            if !valid {
                return Err(RouterError::InvalidApiKey);
            }
            return self.manager.call_tool(&namespaced, args).await;
        }

        // 1. Quote the would-be call.
        let quote_value = self
            .manager
            .call_control_tool(
                server,
                "quote",
                json!({ "tool_name": original, "tool_args": args.clone() }),
            )
            .await?;
        let estimate = parse_quote(&quote_value)?;

        // 2. Quota check; denial carries the remaining values.
        let decision = client
            .check_quota(&api_key, server, &estimate)
            .await
            .map_err(RouterError::Internal)?;
        if !decision.allowed {
            return Err(RouterError::InsufficientCredits {
                remaining_daily: decision.remaining_daily,
                remaining_monthly: decision.remaining_monthly,
            });
        }

        // 3. Forward, measuring wall time.
        let start = std::time::Instant::now();
        let outcome = self.manager.call_tool(&namespaced, args).await;
        let duration_ms = start.elapsed().as_millis() as i64;

        // 4-5. Extract actuals and track; tracking never fails the call.
        let (success, actuals) = match &outcome {
            Ok(result) => (true, extract_actuals(result).unwrap_or_else(|| quoted_actuals(&estimate))),
            Err(_) => (false, quoted_actuals(&estimate)),
        };
        if let Err(e) = client
            .track_usage(
                &api_key,
                server,
                original,
                &estimate,
                actuals,
                duration_ms,
                success,
                identity.user_id.as_deref(),
                identity.user_email.as_deref(),
            )
            .await
        {
            warn!(server = %server, tool = %original, error = %e, "usage tracking failed");
        }

        outcome
    }
}

fn quoted_actuals(estimate: &QuoteEstimate) -> Actuals {
    Actuals {
        input_tokens: estimate.input_tokens,
        output_tokens: estimate.output_tokens.unwrap_or(0),
    }
}

/// Parse a quote tool response: `{ success, estimated_cost: {...} }`.
pub fn parse_quote(value: &Value) -> RouterResult<QuoteEstimate> {
    let success = value
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !success {
        return Err(RouterError::Upstream(format!(
            "quote tool reported failure: {}",
            value
        )));
    }
    let estimate = value
        .get("estimated_cost")
        .cloned()
        .ok_or_else(|| RouterError::Upstream("quote response missing estimated_cost".to_string()))?;
    serde_json::from_value(estimate)
        .map_err(|e| RouterError::Upstream(format!("quote estimate unparseable: {}", e)))
}

/// Sum actual token usage from a result's internal metrics, when present.
///
/// Accepts both key spellings and both shapes seen in the wild: a map of
/// model id to counts, or a list of per-model entries.
pub fn extract_actuals(result: &CallToolResult) -> Option<Actuals> {
    let text = first_text(result)?;
    let value: Value = serde_json::from_str(&text).ok()?;
    let metrics = value
        .get("models_metrics")
        .or_else(|| value.get("modelsMetrics"))?;

    let mut input_tokens = 0i64;
    let mut output_tokens = 0i64;
    let mut seen = false;

    let mut add = |entry: &Value| {
        input_tokens += entry.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
        output_tokens += entry
            .get("output_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        seen = true;
    };

    match metrics {
        Value::Object(models) => {
            for entry in models.values() {
                add(entry);
            }
        }
        Value::Array(models) => {
            for entry in models {
                add(entry);
            }
        }
        _ => return None,
    }

    seen.then_some(Actuals {
        input_tokens,
        output_tokens,
    })
}
