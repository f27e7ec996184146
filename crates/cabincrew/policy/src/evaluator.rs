//! Preflight policy evaluators
//!
//! Each evaluator sees the same [`PreflightInput`] and returns its own
//! [`PreflightOutput`]. A [`PolicySet`] runs them all and turns the outputs
//! into [`PolicyEvaluation`]s ready for aggregation.

use std::sync::Arc;

use async_trait::async_trait;
use cabincrew_types::{
    Decision, PolicyEvaluation, PolicySource, PreflightInput, PreflightOutput, PreflightRequires,
};
use chrono::Utc;
use futures::future::join_all;
use tracing::warn;

use crate::error::Result;

/// Policy evaluation capability (OPA bundle, ONNX model, ...)
#[async_trait]
pub trait PolicyEvaluator: Send + Sync + std::fmt::Debug {
    /// Policy identifier, e.g. the OPA package or model name
    fn policy_id(&self) -> &str;

    /// Kind of evaluator
    fn source(&self) -> PolicySource;

    /// Evaluate one preflight input
    async fn evaluate(&self, input: &PreflightInput) -> Result<PreflightOutput>;
}

/// Ordered set of evaluators run for every preflight
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    evaluators: Vec<Arc<dyn PolicyEvaluator>>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an evaluator
    pub fn add_evaluator(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    /// Run every evaluator concurrently, keeping registration order.
    ///
    /// An evaluator that fails counts as `deny` with the error as reason.
    pub async fn evaluate(&self, input: &PreflightInput) -> Vec<PolicyEvaluation> {
        let outputs = join_all(self.evaluators.iter().map(|e| e.evaluate(input))).await;

        self.evaluators
            .iter()
            .zip(outputs)
            .map(|(evaluator, output)| match output {
                Ok(output) => PolicyEvaluation::from_preflight(
                    evaluator.policy_id(),
                    evaluator.source(),
                    output,
                    Utc::now(),
                ),
                Err(e) => {
                    warn!(
                        workflow_id = %input.workflow_id,
                        policy_id = evaluator.policy_id(),
                        error = %e,
                        "Policy evaluator failed, counting as deny"
                    );
                    PolicyEvaluation::new(evaluator.policy_id(), evaluator.source(), Decision::Deny)
                        .with_reason(e.to_string())
                        .with_violation(format!("policy {} could not be evaluated", evaluator.policy_id()))
                }
            })
            .collect()
    }
}

/// Evaluator that always returns the same output
#[derive(Debug, Clone)]
pub struct FixedEvaluator {
    policy_id: String,
    source: PolicySource,
    output: PreflightOutput,
}

impl FixedEvaluator {
    pub fn new(policy_id: impl Into<String>, source: PolicySource, output: PreflightOutput) -> Self {
        Self {
            policy_id: policy_id.into(),
            source,
            output,
        }
    }

    /// Allows everything
    pub fn allow_all(policy_id: impl Into<String>) -> Self {
        Self::new(policy_id, PolicySource::Custom, PreflightOutput::allow())
    }

    /// Denies everything with `reason` as the violation
    pub fn deny_all(policy_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            policy_id,
            PolicySource::Custom,
            PreflightOutput {
                decision: Decision::Deny,
                requires: None,
                violations: vec![reason.into()],
                warnings: Vec::new(),
            },
        )
    }

    /// Demands approval from `role`
    pub fn require_approval(
        policy_id: impl Into<String>,
        role: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            policy_id,
            PolicySource::Custom,
            PreflightOutput {
                decision: Decision::RequireApproval,
                requires: Some(PreflightRequires {
                    role: Some(role.into()),
                    reason: Some(reason.into()),
                }),
                violations: Vec::new(),
                warnings: Vec::new(),
            },
        )
    }
}

#[async_trait]
impl PolicyEvaluator for FixedEvaluator {
    fn policy_id(&self) -> &str {
        &self.policy_id
    }

    fn source(&self) -> PolicySource {
        self.source
    }

    async fn evaluate(&self, _input: &PreflightInput) -> Result<PreflightOutput> {
        Ok(self.output.clone())
    }
}
