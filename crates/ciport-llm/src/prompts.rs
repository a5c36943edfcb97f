use ciport_core::types::CiKind;

pub const TRANSLATE_SYSTEM: &str =
    "You are a CI/CD migration expert. You MUST output only the target CI/CD format requested.";

/// Build the translation prompt. `feedback` carries validator output from a
/// previous round; the model is told explicitly not to echo the source
/// format, which is the most common failure mode.
pub fn translate_prompt(source_ci: CiKind, content: &str, feedback: Option<&str>) -> String {
    let feedback_block = match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(feedback) => format!(
            "\n\n=== VALIDATION FEEDBACK ===\n\
             The previous GitHub Actions YAML you generated had the following issues:\n\n\
             {feedback}\n\n\
             Please generate a NEW GitHub Actions YAML that fixes these issues.\n\
             DO NOT return the {} source - you must return VALID GitHub Actions YAML.\n\
             === END FEEDBACK ===\n\n",
            source_ci.display_name()
        ),
        None => String::new(),
    };

    format!(
        "You are a CI/CD migration expert.\n\n\
         TASK: Convert the configuration below into a GitHub Actions workflow.\n\n\
         CRITICAL REQUIREMENTS:\n\
         1. You MUST output ONLY valid GitHub Actions workflow YAML syntax\n\
         2. DO NOT include any explanations, comments, or markdown\n\
         3. DO NOT wrap output in code blocks (```yaml)\n\
         4. Preserve all build, test, deploy, and service logic from the source config\n\
         5. Use proper GitHub Actions syntax with jobs, steps, and actions\n\
         6. Services must be mappings: services:\\n  mysql:\\n    image: mysql:latest\n\
         7. Use latest action versions: actions/checkout@v4, actions/setup-java@v4\n\
         8. Use $(command) not backticks for shell substitution\n\
         9. Combine similar jobs intelligently (e.g., merge multiple 'build' jobs)\n\
         10. Preserve environment variables, secrets, and dependencies from the source\n\n\
         {feedback_block}\
         SOURCE CI/CD CONFIGURATION TO CONVERT ({source_name}):\n\
         ---\n\
         {content}\n\
         ---\n\n\
         Now generate ONE comprehensive GitHub Actions workflow YAML that includes ALL the logic above (and NOTHING else):",
        source_name = source_ci.display_name(),
    )
}

pub const VERIFY_SYSTEM: &str = "You are a CI/CD migration reviewer. You compare a source CI \
configuration against a GitHub Actions translation and respond with a strict JSON verdict. \
Output ONLY JSON, no prose, no markdown.";

/// Semantic double-check prompt: demands the JSON envelope the pipeline
/// post-processes (`passed`, `reasons`, `missing_features`,
/// `hallucinated_steps`, `confidence`).
pub fn verify_prompt(source_ci: CiKind, source_yaml: &str, translated_yaml: &str) -> String {
    format!(
        "Compare the following {source_name} configuration with its GitHub Actions translation \
         and judge whether the translation preserves the source's behaviour.\n\n\
         === SOURCE ({source_name}) ===\n\
         {source_yaml}\n\
         === END SOURCE ===\n\n\
         === TRANSLATED (GitHub Actions) ===\n\
         {translated_yaml}\n\
         === END TRANSLATED ===\n\n\
         Respond with EXACTLY this JSON shape and nothing else:\n\
         {{\n\
           \"passed\": true or false,\n\
           \"reasons\": [\"short sentences explaining the verdict\"],\n\
           \"missing_features\": [\"source capabilities absent from the translation\"],\n\
           \"hallucinated_steps\": [\"translated steps with no source counterpart\"],\n\
           \"confidence\": 0.0 to 1.0\n\
         }}\n\n\
         Judge on behaviour: build/test/deploy commands, service containers, environment \
         variables, secrets, triggers, and matrix dimensions. Standard checkout and language \
         setup steps are expected additions on GitHub Actions.",
        source_name = source_ci.display_name(),
    )
}

pub const REPAIR_SYSTEM: &str = "You are an expert at fixing GitHub Actions workflow files.\n\n\
Given a YAML workflow file and error logs from a failed GitHub Actions run, analyze the error \
and provide a fixed version of the workflow.\n\n\
Rules:\n\
1. Only fix the specific error indicated in the logs\n\
2. Preserve all other functionality\n\
3. Do not add unnecessary changes\n\
4. Ensure the output is valid YAML\n\
5. Keep the same overall structure and intent\n\n\
Output ONLY the corrected YAML content, nothing else. No explanations, no markdown code \
blocks, just the raw YAML.";

/// Token budgets are finite; only this much of the failing log rides along.
const REPAIR_LOG_LIMIT: usize = 3000;

pub fn repair_prompt(workflow_yaml: &str, error_logs: &str) -> String {
    let mut cut = error_logs.len().min(REPAIR_LOG_LIMIT);
    while cut > 0 && !error_logs.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "The following GitHub Actions workflow failed with this error:\n\n\
         ### Error Logs:\n\
         ```\n\
         {}\n\
         ```\n\n\
         ### Original Workflow YAML:\n\
         ```yaml\n\
         {workflow_yaml}\n\
         ```\n\n\
         Please provide the corrected workflow YAML that fixes this error.",
        &error_logs[..cut],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_prompt_names_the_source() {
        let p = translate_prompt(CiKind::Travis, "language: python", None);
        assert!(p.contains("SOURCE CI/CD CONFIGURATION TO CONVERT (Travis)"));
        assert!(p.contains("language: python"));
        assert!(!p.contains("VALIDATION FEEDBACK"));
    }

    #[test]
    fn translate_prompt_embeds_feedback_when_given() {
        let p = translate_prompt(CiKind::Travis, "language: python", Some("bad runner label"));
        assert!(p.contains("=== VALIDATION FEEDBACK ==="));
        assert!(p.contains("bad runner label"));
        assert!(p.contains("DO NOT return the Travis source"));
    }

    #[test]
    fn blank_feedback_is_ignored() {
        let p = translate_prompt(CiKind::Travis, "x", Some("  "));
        assert!(!p.contains("VALIDATION FEEDBACK"));
    }

    #[test]
    fn verify_prompt_demands_the_json_envelope() {
        let p = verify_prompt(CiKind::CircleCi, "jobs: {}", "name: CI");
        for field in ["passed", "reasons", "missing_features", "hallucinated_steps", "confidence"] {
            assert!(p.contains(field), "missing field {field}");
        }
    }

    #[test]
    fn repair_prompt_truncates_huge_logs() {
        let logs = "e".repeat(10_000);
        let p = repair_prompt("name: CI", &logs);
        assert!(p.len() < 5_000);
        assert!(p.contains("### Error Logs:"));
    }
}
