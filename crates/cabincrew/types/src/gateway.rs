//! LLM and MCP gateway interceptor boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::Decision;
use crate::value::Metadata;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmGatewayRequest {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Metadata>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McpGatewayRequest {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub server_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Metadata>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Llm,
    Mcp,
}

/// Either kind of intercepted request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "gateway_type", rename_all = "snake_case")]
pub enum GatewayRequest {
    Llm(LlmGatewayRequest),
    Mcp(McpGatewayRequest),
}

impl GatewayRequest {
    pub fn kind(&self) -> GatewayKind {
        match self {
            GatewayRequest::Llm(_) => GatewayKind::Llm,
            GatewayRequest::Mcp(_) => GatewayKind::Mcp,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            GatewayRequest::Llm(r) => &r.request_id,
            GatewayRequest::Mcp(r) => &r.request_id,
        }
    }

    /// Model name for LLM traffic, `server_id/method` for MCP traffic.
    pub fn target(&self) -> String {
        match self {
            GatewayRequest::Llm(r) => r.model.clone(),
            GatewayRequest::Mcp(r) => format!("{}/{}", r.server_id, r.method),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayApproval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Verdict returned to the interceptor. Shares the aggregator's [`Decision`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub decision: Decision,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<GatewayApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_request: Option<serde_json::Value>,
}
