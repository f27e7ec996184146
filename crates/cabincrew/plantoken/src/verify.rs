use std::collections::HashMap;

use cabincrew_types::{hash_artifacts, ContentHash, EngineArtifact, PlanArtifactHash, PlanToken};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::builder::compute_token;
use crate::error::PlanTokenError;

/// Outcome of checking a presented plan token against the bound hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub matched: bool,
    /// Digest recomputed from the presented token's fields.
    pub actual: ContentHash,
    pub differences: Vec<String>,
}

/// Check that `current` is exactly the plan bound by `expected`.
///
/// The presented `token` field is not trusted: the digest is recomputed from
/// the fields, so a token whose fields were edited without updating `token`
/// is caught too.
pub fn verify(expected: &ContentHash, current: &PlanToken) -> Result<Verification, PlanTokenError> {
    let actual = compute_token(current)?;
    let mut differences = Vec::new();
    if current.token != actual {
        differences.push(format!(
            "token field {} does not match recomputed digest {}",
            current.token.short(),
            actual.short()
        ));
    }
    if &actual != expected {
        differences.push(format!(
            "plan token {} differs from expected {}",
            actual.short(),
            expected.short()
        ));
    }
    let matched = differences.is_empty();
    debug!(expected = %expected.short(), actual = %actual.short(), matched, "Plan token verified");
    Ok(Verification {
        matched,
        actual,
        differences,
    })
}

/// [`verify`] against a stored plan, with field-level differences.
pub fn verify_plan(expected: &PlanToken, current: &PlanToken) -> Result<Verification, PlanTokenError> {
    let mut verification = verify(&expected.token, current)?;
    if !verification.matched {
        verification.differences.extend(diff(expected, current));
    }
    Ok(verification)
}

/// Human-readable list of what changed between two plans.
pub fn diff(expected: &PlanToken, current: &PlanToken) -> Vec<String> {
    let mut out = Vec::new();

    let mut field = |name: &str, a: Option<&str>, b: Option<&str>| {
        if a != b {
            out.push(format!(
                "{name}: {} -> {}",
                a.unwrap_or("<none>"),
                b.unwrap_or("<none>")
            ));
        }
    };
    field("version", Some(&expected.version), Some(&current.version));
    field("engine_id", Some(&expected.engine_id), Some(&current.engine_id));
    field(
        "protocol_version",
        Some(&expected.protocol_version),
        Some(&current.protocol_version),
    );
    field(
        "workspace_hash",
        Some(&expected.workspace_hash),
        Some(&current.workspace_hash),
    );
    field("model", Some(&expected.model), Some(&current.model));
    field(
        "governance_hash",
        expected.governance_hash.as_deref(),
        current.governance_hash.as_deref(),
    );
    field(
        "policy_digest",
        expected.policy_digest.as_deref(),
        current.policy_digest.as_deref(),
    );
    if expected.created_at != current.created_at {
        out.push(format!(
            "created_at: {} -> {}",
            expected.created_at.to_rfc3339(),
            current.created_at.to_rfc3339()
        ));
    }

    if hash_artifacts(&expected.artifacts) != hash_artifacts(&current.artifacts) {
        out.extend(diff_artifacts(&expected.artifacts, &current.artifacts));
        if out.is_empty() || !out.iter().any(|d| d.starts_with("artifact")) {
            out.push("artifacts: order changed".into());
        }
    }
    out
}

fn diff_artifacts(expected: &[PlanArtifactHash], current: &[PlanArtifactHash]) -> Vec<String> {
    let current_by_name: HashMap<&str, &PlanArtifactHash> =
        current.iter().map(|a| (a.name.as_str(), a)).collect();
    let expected_by_name: HashMap<&str, &PlanArtifactHash> =
        expected.iter().map(|a| (a.name.as_str(), a)).collect();

    let mut out = Vec::new();
    for planned in expected {
        match current_by_name.get(planned.name.as_str()) {
            None => out.push(format!("artifact {} removed", planned.name)),
            Some(now) => {
                if planned.hash != now.hash {
                    out.push(format!(
                        "artifact {} hash: {} -> {}",
                        planned.name, planned.hash, now.hash
                    ));
                }
                if planned.size != now.size {
                    out.push(format!(
                        "artifact {} size: {} -> {}",
                        planned.name,
                        fmt_size(planned.size),
                        fmt_size(now.size)
                    ));
                }
            }
        }
    }
    for added in current {
        if !expected_by_name.contains_key(added.name.as_str()) {
            out.push(format!("artifact {} added", added.name));
        }
    }
    out
}

fn fmt_size(size: Option<u64>) -> String {
    size.map(|s| s.to_string()).unwrap_or_else(|| "<none>".into())
}

/// Outcome of matching take-off artifacts against the plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactValidation {
    pub matched: bool,
    pub differences: Vec<String>,
}

/// Check that take-off produced exactly the planned artifacts.
///
/// Every planned artifact must appear with the same hash, and the same size
/// when both sides report one. Artifacts absent from the plan are rejected.
/// Order does not matter here; the plan's order is bound by its token.
pub fn validate_takeoff_artifacts(
    plan: &PlanToken,
    produced: &[EngineArtifact],
) -> ArtifactValidation {
    let mut produced_by_name: HashMap<&str, &EngineArtifact> = HashMap::new();
    let mut differences = Vec::new();
    for artifact in produced {
        if produced_by_name.insert(artifact.name.as_str(), artifact).is_some() {
            differences.push(format!("artifact {} reported more than once", artifact.name));
        }
    }

    for planned in &plan.artifacts {
        match produced_by_name.remove(planned.name.as_str()) {
            None => differences.push(format!("artifact {} missing from take-off", planned.name)),
            Some(actual) => {
                if !actual.hash.eq_ignore_ascii_case(&planned.hash) {
                    differences.push(format!(
                        "artifact {} hash: planned {}, got {}",
                        planned.name, planned.hash, actual.hash
                    ));
                }
                if let (Some(expected), Some(got)) = (planned.size, actual.size) {
                    if expected != got {
                        differences.push(format!(
                            "artifact {} size: planned {expected}, got {got}",
                            planned.name
                        ));
                    }
                }
            }
        }
    }

    let mut unplanned: Vec<&str> = produced_by_name.into_keys().collect();
    unplanned.sort_unstable();
    for name in unplanned {
        differences.push(format!("artifact {name} was not planned"));
    }

    ArtifactValidation {
        matched: differences.is_empty(),
        differences,
    }
}
