//! # CabinCrew Policy
//!
//! Preflight policy evaluation and aggregation.
//!
//! ## Overview
//!
//! After a flight-plan, every configured [`PolicyEvaluator`] judges the
//! engine's output. The [`Aggregator`] folds their decisions into one:
//!
//! - `most_restrictive` (default): highest severity wins
//! - `any_deny`: any deny denies
//! - `all_allow`: allow only if everyone allows
//! - `unanimous`: disagreement escalates to `require_approval`
//! - `majority`: strict majority, else most restrictive
//! - `custom`: a registered [`CustomAggregation`] strategy
//!
//! Evaluators fail closed: an error becomes a `deny` evaluation.
//!
//! The [`GatewayGuard`] applies the same machinery to LLM and MCP traffic
//! intercepted while an engine runs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cabincrew_policy::{Aggregator, FixedEvaluator, PolicySet};
//! use cabincrew_types::{AggregationMethod, PreflightInput};
//!
//! # async fn example(input: PreflightInput) -> cabincrew_policy::Result<()> {
//! let policies = PolicySet::new()
//!     .add_evaluator(Arc::new(FixedEvaluator::allow_all("opa.base")))
//!     .add_evaluator(Arc::new(FixedEvaluator::require_approval("opa.prod", "sre", "touches prod")));
//!
//! let evaluations = policies.evaluate(&input).await;
//! let aggregated = Aggregator::new(AggregationMethod::MostRestrictive).aggregate(evaluations)?;
//! println!("decision: {}", aggregated.decision);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod aggregate;
pub mod error;
pub mod evaluator;
pub mod gateway;

pub use aggregate::{AggregatedDecision, Aggregator, CustomAggregation, DEFAULT_APPROVAL_ROLE};
pub use error::{PolicyError, Result};
pub use evaluator::{FixedEvaluator, PolicyEvaluator, PolicySet};
pub use gateway::{audit_gateway, GatewayEvaluator, GatewayGuard, GatewayVerdict};
