use crate::types::{DoubleCheckOutcome, RawVerdict, StageStatus};

/// Steps the verifier may flag as hallucinated but which are permitted
/// additions on the target platform (checkout and language setup).
const ALLOWED_ADDITIONS: &[&str] = &[
    "actions/checkout",
    "checkout",
    "actions/checkout@v4",
    "actions/checkout@v3",
    "actions/setup-",
    "setup-node",
    "setup-python",
    "setup-java",
    "setup-go",
];

/// A missing feature mentioning any of these is real capability loss and
/// forces a failure regardless of what the model concluded.
const SIGNIFICANT_MISSING: &[&str] = &[
    "docker",
    "container",
    "image",
    "service",
    "environment",
    "env",
    "command",
    "script",
    "step",
];

/// Post-process the verifier model's raw verdict into the stage outcome.
/// The rules here are contract, not heuristics: hallucinated standard setup
/// steps are filtered (and a failure on that sole ground flips to pass),
/// while significant missing features force a failure even on a model pass.
pub fn refine_verdict(raw: RawVerdict) -> DoubleCheckOutcome {
    let mut passed = raw.passed;

    let filtered_hallucinated: Vec<String> = raw
        .hallucinated_steps
        .iter()
        .filter(|h| {
            let h = h.to_lowercase();
            !ALLOWED_ADDITIONS.iter().any(|a| h.contains(a))
        })
        .cloned()
        .collect();

    if !raw.hallucinated_steps.is_empty() && filtered_hallucinated.is_empty() {
        passed = true;
    }

    let significant_missing: Vec<String> = raw
        .missing_features
        .iter()
        .filter(|m| {
            let m = m.to_lowercase();
            SIGNIFICANT_MISSING.iter().any(|k| m.contains(k))
        })
        .cloned()
        .collect();

    if !significant_missing.is_empty() {
        passed = false;
    }

    let mut reasons = raw.reasons.clone();
    if !filtered_hallucinated.is_empty() {
        reasons.push(format!(
            "Additional steps not in source: {}",
            filtered_hallucinated.join(", ")
        ));
    }
    if !significant_missing.is_empty() {
        reasons.push(format!(
            "CRITICAL: Missing significant features: {}",
            significant_missing.join(", ")
        ));
    } else if !raw.missing_features.is_empty() {
        reasons.push(format!("Missing features: {}", raw.missing_features.join(", ")));
    }
    if raw.confidence > 0.0 {
        reasons.push(format!("Confidence: {:.0}%", raw.confidence * 100.0));
    }

    DoubleCheckOutcome {
        status: if passed {
            StageStatus::Success
        } else {
            StageStatus::Failed
        },
        passed,
        confidence: raw.confidence,
        reasons,
        missing_features: raw.missing_features,
        hallucinated_steps: filtered_hallucinated,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hallucinated_checkout_is_filtered_and_verdict_flips() {
        let raw = RawVerdict {
            passed: false,
            hallucinated_steps: vec!["actions/checkout@v4".into()],
            confidence: 0.9,
            ..RawVerdict::default()
        };
        let out = refine_verdict(raw);
        assert!(out.passed);
        assert_eq!(out.status, StageStatus::Success);
        assert!(out.hallucinated_steps.is_empty());
    }

    #[test]
    fn setup_actions_are_permitted_additions() {
        let raw = RawVerdict {
            passed: false,
            hallucinated_steps: vec!["Setup Python (actions/setup-python@v5)".into()],
            ..RawVerdict::default()
        };
        assert!(refine_verdict(raw).passed);
    }

    #[test]
    fn genuine_hallucinations_survive_filtering() {
        let raw = RawVerdict {
            passed: false,
            hallucinated_steps: vec!["deploy-to-production".into(), "actions/checkout@v4".into()],
            ..RawVerdict::default()
        };
        let out = refine_verdict(raw);
        assert!(!out.passed);
        assert_eq!(out.hallucinated_steps, vec!["deploy-to-production".to_string()]);
    }

    #[test]
    fn significant_missing_features_force_failure() {
        let raw = RawVerdict {
            passed: true,
            missing_features: vec!["mysql service container".into()],
            confidence: 0.95,
            ..RawVerdict::default()
        };
        let out = refine_verdict(raw);
        assert!(!out.passed);
        assert!(out
            .reasons
            .iter()
            .any(|r| r.starts_with("CRITICAL: Missing significant features")));
    }

    #[test]
    fn insignificant_missing_features_keep_the_pass() {
        let raw = RawVerdict {
            passed: true,
            missing_features: vec!["cache of pip downloads".into()],
            ..RawVerdict::default()
        };
        let out = refine_verdict(raw);
        assert!(out.passed);
        assert!(out.reasons.iter().any(|r| r.starts_with("Missing features")));
    }

    #[test]
    fn lenient_pass_survives_refinement() {
        let out = refine_verdict(RawVerdict::lenient_pass());
        assert!(out.passed);
        assert!((out.confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn confidence_is_reported_as_a_reason() {
        let raw = RawVerdict {
            passed: true,
            confidence: 0.85,
            ..RawVerdict::default()
        };
        let out = refine_verdict(raw);
        assert!(out.reasons.iter().any(|r| r == "Confidence: 85%"));
    }
}
