//! Built-in reviewer that calls the resolved provider directly.
//!
//! Sends the bounded diff with a strict JSON-only instruction and parses the
//! reply into findings. Models wrap answers in prose or code fences often
//! enough that extraction is tolerant: the first top-level JSON array in the
//! reply wins. Anything unparseable becomes an `AgentResult::Failure`, never
//! an error.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agents::AgentInput;
use crate::findings::{AgentResult, Finding};
use llm_providers::{LlmClient, LlmRequest, ResolvedProvider};

const SYSTEM_PROMPT: &str = "You are a code review agent running in CI. \
Review the unified diff and report genuine issues on changed lines only. \
Respond with a JSON array, no prose. Each element: \
{\"severity\":\"error|warning|info\",\"file\":\"<repo-relative path>\",\
\"line\":<new-file line number>,\"message\":\"<issue>\",\
\"suggestion\":\"<optional fix>\",\"rule_id\":\"<optional stable id>\"}. \
Respond with [] when nothing is worth raising.";

const MAX_OUTPUT_TOKENS: u32 = 2_000;

/// Run the built-in reviewer. Mirrors the subprocess adapter contract:
/// always returns an `AgentResult`.
pub async fn run(
    provider: &ResolvedProvider,
    input: &AgentInput,
    timeout: Duration,
    cancel: &CancellationToken,
) -> AgentResult {
    if input.diff.trim().is_empty() {
        return AgentResult::Success { findings: vec![] };
    }

    let client = match LlmClient::from_resolved(provider) {
        Ok(client) => client,
        Err(e) => {
            return AgentResult::Failure {
                error: format!("client init: {e}"),
                partial_findings: vec![],
            };
        }
    };

    let request = LlmRequest {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "PR #{pr}, head {head}. Changed files: {count}.\n\n{diff}",
            pr = input
                .pr_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "—".into()),
            head = input.head_sha,
            count = input.files.len(),
            diff = input.diff,
        ),
        max_tokens: MAX_OUTPUT_TOKENS,
    };

    debug!(model = %provider.model, "local_llm: generate");
    let reply = tokio::select! {
        reply = client.generate(&request) => match reply {
            Ok(reply) => reply,
            Err(e) => {
                return AgentResult::Failure {
                    error: format!("llm call failed: {e}"),
                    partial_findings: vec![],
                };
            }
        },
        _ = tokio::time::sleep(timeout) => {
            return AgentResult::Failure {
                error: "timeout".into(),
                partial_findings: vec![],
            };
        }
        _ = cancel.cancelled() => {
            return AgentResult::Failure {
                error: "cancelled".into(),
                partial_findings: vec![],
            };
        }
    };

    match parse_reply(&reply) {
        Ok(mut findings) => {
            for f in &mut findings {
                f.source_agent = "local_llm".to_string();
            }
            AgentResult::Success { findings }
        }
        Err(e) => {
            warn!(error = %e, "local_llm: unparseable reply");
            AgentResult::Failure {
                error: format!("invalid JSON from model: {e}"),
                partial_findings: vec![],
            }
        }
    }
}

/// Extract and decode the first top-level JSON array in the reply.
fn parse_reply(reply: &str) -> Result<Vec<Finding>, String> {
    let Some(start) = reply.find('[') else {
        return Err("no JSON array in reply".into());
    };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in reply[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &reply[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).map_err(|e| e.to_string());
                }
            }
            _ => {}
        }
    }
    Err("unterminated JSON array in reply".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_array_parses() {
        let reply = r#"[{"severity":"warning","file":"src/a.rs","line":3,
            "message":"m","source_agent":""}]"#;
        let findings = parse_reply(reply).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line, Some(3));
    }

    #[test]
    fn fenced_and_prefixed_replies_parse() {
        let reply = "Here is my review:\n```json\n[{\"severity\":\"info\",\
            \"file\":\"a.rs\",\"message\":\"m\",\"source_agent\":\"\"}]\n```\nDone.";
        let findings = parse_reply(reply).unwrap();
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn nested_arrays_and_bracketed_strings_do_not_confuse_extraction() {
        let reply = r#"[{"severity":"info","file":"a.rs","message":"see [docs] for x[1]",
            "source_agent":"","metadata":{"tags":"[a,b]"}}] trailing ]"#;
        let findings = parse_reply(reply).unwrap();
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("[docs]"));
    }

    #[test]
    fn empty_array_is_fine_and_prose_is_not() {
        assert!(parse_reply("[]").unwrap().is_empty());
        assert!(parse_reply("I found no issues.").is_err());
        assert!(parse_reply("[{\"truncated\":").is_err());
    }
}
