//! Subprocess adapter: isolated environment, stdin handoff, deadline, and
//! graceful teardown.
//!
//! Every agent process starts from an empty environment plus the allowlist
//! the orchestrator built; no shell is ever involved. On timeout or
//! cancellation the child first gets SIGTERM, then SIGKILL after a short
//! grace period. The adapter never returns an error: every failure mode is
//! folded into `AgentResult::Failure` so one broken agent cannot take down
//! the run.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agents::{AgentSpec, parse_agent_output};
use crate::findings::AgentResult;

/// Per-invocation deadline.
pub const AGENT_TIMEOUT_SECS: u64 = 120;

/// SIGTERM → SIGKILL grace window.
const KILL_GRACE_SECS: u64 = 2;

/// Run one subprocess agent to completion, under deadline and cancellation.
pub async fn run_command_agent(
    spec: &AgentSpec,
    input_json: Vec<u8>,
    env: &BTreeMap<String, String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> AgentResult {
    let Some((program, args)) = spec.command.split_first() else {
        return AgentResult::Failure {
            error: "agent has no command".into(),
            partial_findings: vec![],
        };
    };

    debug!(agent = spec.id, program, "agent: spawning");
    let mut child = match Command::new(program)
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return AgentResult::Failure {
                error: format!("failed to spawn '{program}': {e}"),
                partial_findings: vec![],
            };
        }
    };

    // Hand the context over and close stdin so the agent sees EOF.
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(&input_json).await {
            warn!(agent = spec.id, error = %e, "agent: stdin write failed");
        }
        drop(stdin);
    }

    // Drain pipes concurrently so a chatty agent never blocks on backpressure.
    let stdout_task = tokio::spawn(read_all(child.stdout.take()));
    let stderr_task = tokio::spawn(read_all(child.stderr.take()));

    // The wait future borrows the child; both abort paths wait for that
    // borrow to end before tearing the process down.
    let waited = tokio::time::timeout(timeout, async {
        tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        }
    })
    .await;

    let status = match waited {
        Ok(Some(Ok(status))) => status,
        Ok(Some(Err(e))) => {
            return AgentResult::Failure {
                error: format!("wait failed: {e}"),
                partial_findings: vec![],
            };
        }
        Ok(None) => {
            debug!(agent = spec.id, "agent: cancelled");
            terminate_gracefully(&mut child).await;
            return AgentResult::Failure {
                error: "cancelled".into(),
                partial_findings: vec![],
            };
        }
        Err(_) => {
            warn!(agent = spec.id, timeout_secs = timeout.as_secs(), "agent: timeout");
            terminate_gracefully(&mut child).await;
            return AgentResult::Failure {
                error: "timeout".into(),
                partial_findings: vec![],
            };
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        let stderr_tail = tail(&stderr, 400);
        // Non-zero exit may still carry partial findings on stdout.
        let partial_findings = parse_agent_output(spec.id, &stdout)
            .ok()
            .map(|r| match r {
                AgentResult::Success { findings } => findings,
                AgentResult::Failure {
                    partial_findings, ..
                } => partial_findings,
                AgentResult::Skipped { .. } => vec![],
            })
            .unwrap_or_default();
        return AgentResult::Failure {
            error: format!("exit status {code}: {stderr_tail}"),
            partial_findings,
        };
    }

    match parse_agent_output(spec.id, &stdout) {
        Ok(result) => result,
        Err(e) => AgentResult::Failure {
            error: e,
            partial_findings: vec![],
        },
    }
}

async fn read_all<R>(reader: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

/// SIGTERM the child, give it a grace period, then SIGKILL.
async fn terminate_gracefully(child: &mut Child) {
    if let Some(pid) = child.id() {
        // Safety: plain signal send to a child we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let grace = tokio::time::timeout(Duration::from_secs(KILL_GRACE_SECS), child.wait()).await;
        if grace.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

fn tail(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.len() <= limit {
        trimmed.to_string()
    } else {
        let start = trimmed.len() - limit;
        // Snap to a char boundary.
        let start = (start..trimmed.len())
            .find(|i| trimmed.is_char_boundary(*i))
            .unwrap_or(start);
        format!("…{}", &trimmed[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;

    fn spec(command: &'static [&'static str]) -> AgentSpec {
        AgentSpec {
            id: "semgrep",
            kind: AgentKind::Static,
            command,
            needs_llm_credentials: false,
            extra_env: &[],
        }
    }

    fn base_env() -> BTreeMap<String, String> {
        [("PATH".to_string(), "/usr/bin:/bin".to_string())].into()
    }

    #[tokio::test]
    async fn successful_agent_output_is_parsed() {
        // `cat` echoes stdin; feed it a findings array.
        let input = br#"[{"severity":"info","file":"a.rs","message":"m","source_agent":"x"}]"#;
        let result = run_command_agent(
            &spec(&["cat"]),
            input.to_vec(),
            &base_env(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, AgentResult::Success { findings } if findings.len() == 1));
    }

    #[tokio::test]
    async fn missing_executable_is_a_failure_not_a_panic() {
        let result = run_command_agent(
            &spec(&["definitely-not-a-real-binary-name"]),
            vec![],
            &base_env(),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, AgentResult::Failure { error, .. } if error.contains("spawn")));
    }

    #[tokio::test]
    async fn timeout_produces_the_timeout_failure() {
        let result = run_command_agent(
            &spec(&["sleep", "30"]),
            vec![],
            &base_env(),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, AgentResult::Failure { error, .. } if error == "timeout"));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_agent() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_command_agent(
            &spec(&["sleep", "30"]),
            vec![],
            &base_env(),
            Duration::from_secs(30),
            &cancel,
        )
        .await;
        assert!(matches!(result, AgentResult::Failure { error, .. } if error == "cancelled"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_stderr() {
        let result = run_command_agent(
            &spec(&["false"]),
            vec![],
            &base_env(),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, AgentResult::Failure { error, .. } if error.contains("exit status")));
    }
}
