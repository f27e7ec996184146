//! Policy guard for LLM and MCP gateway interceptors
//!
//! Gateways sit between an engine and the models or tool servers it calls.
//! Every intercepted request goes through the same evaluate-then-aggregate
//! path as preflight, so the decision vocabulary is shared.

use std::sync::Arc;

use async_trait::async_trait;
use cabincrew_types::{
    ApprovalId, AuditGateway, Decision, GatewayApproval, GatewayKind, GatewayRequest,
    GatewayResponse, PolicyEvaluation, PolicySource, PreflightRequires,
};
use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::aggregate::Aggregator;
use crate::error::Result;

/// One gateway evaluator's verdict
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayVerdict {
    pub decision: Decision,
    pub requires: Option<PreflightRequires>,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    /// Model the request should be sent to instead
    pub routed_model: Option<String>,
    /// Replacement for the request's input (LLM) or whole request (MCP)
    pub rewritten: Option<serde_json::Value>,
}

impl GatewayVerdict {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            requires: None,
            violations: Vec::new(),
            warnings: Vec::new(),
            routed_model: None,
            rewritten: None,
        }
    }

    pub fn allow() -> Self {
        Self::new(Decision::Allow)
    }
}

/// Evaluator for intercepted gateway traffic
#[async_trait]
pub trait GatewayEvaluator: Send + Sync + std::fmt::Debug {
    fn policy_id(&self) -> &str;

    /// Check if this evaluator applies to the given gateway
    fn applies_to(&self, _kind: GatewayKind) -> bool {
        true
    }

    async fn evaluate(&self, request: &GatewayRequest) -> Result<GatewayVerdict>;
}

/// Runs gateway evaluators and aggregates their verdicts
#[derive(Debug, Clone, Default)]
pub struct GatewayGuard {
    evaluators: Vec<Arc<dyn GatewayEvaluator>>,
    aggregator: Aggregator,
}

impl GatewayGuard {
    pub fn new(aggregator: Aggregator) -> Self {
        Self {
            evaluators: Vec::new(),
            aggregator,
        }
    }

    /// Add an evaluator
    pub fn add_evaluator(mut self, evaluator: Arc<dyn GatewayEvaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Decide on one intercepted request.
    ///
    /// Evaluator failures count as `deny`. Routing and rewrites are taken from
    /// the first evaluator that supplied one, and dropped on `deny`.
    pub async fn check(&self, request: &GatewayRequest) -> Result<GatewayResponse> {
        let kind = request.kind();
        let source = match kind {
            GatewayKind::Llm => PolicySource::LlmGateway,
            GatewayKind::Mcp => PolicySource::McpGateway,
        };
        let applicable: Vec<_> = self
            .evaluators
            .iter()
            .filter(|e| e.applies_to(kind))
            .collect();
        let verdicts = join_all(applicable.iter().map(|e| e.evaluate(request))).await;

        let mut evaluations = Vec::with_capacity(verdicts.len());
        let mut routed_model = None;
        let mut rewritten = None;
        for (evaluator, verdict) in applicable.iter().zip(verdicts) {
            let verdict = verdict.unwrap_or_else(|e| {
                warn!(
                    request_id = request.request_id(),
                    policy_id = evaluator.policy_id(),
                    error = %e,
                    "Gateway evaluator failed, counting as deny"
                );
                let mut denied = GatewayVerdict::new(Decision::Deny);
                denied.violations.push(e.to_string());
                denied
            });
            routed_model = routed_model.or(verdict.routed_model);
            rewritten = rewritten.or(verdict.rewritten);

            let mut evaluation = PolicyEvaluation::new(evaluator.policy_id(), source, verdict.decision);
            evaluation.reason = verdict.requires.as_ref().and_then(|r| r.reason.clone());
            evaluation.requires = verdict.requires;
            evaluation.violations = verdict.violations;
            evaluation.warnings = verdict.warnings;
            evaluations.push(evaluation);
        }

        let aggregated = self.aggregator.aggregate(evaluations)?;
        let approval = aggregated.requires.as_ref().map(|requires| GatewayApproval {
            approval_id: Some(ApprovalId::generate().to_string()),
            required_role: requires.role.clone(),
            reason: requires.reason.clone(),
        });
        if aggregated.is_denied() {
            routed_model = None;
            rewritten = None;
        }
        let (rewritten_input, rewritten_request) = match kind {
            GatewayKind::Llm => (rewritten, None),
            GatewayKind::Mcp => (None, rewritten),
        };

        info!(
            request_id = request.request_id(),
            target = %request.target(),
            decision = %aggregated.decision,
            "Gateway request evaluated"
        );

        Ok(GatewayResponse {
            request_id: request.request_id().to_string(),
            timestamp: Utc::now(),
            decision: aggregated.decision,
            warnings: aggregated.warnings,
            violations: aggregated.violations,
            approval,
            routed_model,
            rewritten_input,
            rewritten_request,
        })
    }
}

/// Audit record for a gateway decision
pub fn audit_gateway(request: &GatewayRequest, response: &GatewayResponse) -> AuditGateway {
    let (gateway_type, model, tool) = match request {
        GatewayRequest::Llm(r) => ("llm", Some(r.model.clone()), None),
        GatewayRequest::Mcp(r) => ("mcp", None, Some(format!("{}/{}", r.server_id, r.method))),
    };
    AuditGateway {
        gateway_type: Some(gateway_type.to_string()),
        request_id: Some(response.request_id.clone()),
        model: response.routed_model.clone().or(model),
        tool,
        policy_decision: Some(response.decision),
    }
}
