//! CI entrypoint: wire environment and config into the review pipeline and
//! translate the outcome into an exit code.
//!
//! Exit codes: 0 success, 1 preflight/configuration error, 2 budget blocked
//! the run, 3 forge API failure after retries, 4 cancelled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, bail};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use review_pipeline::{
    AdoContext, ForgeContext, GitHubContext, ReviewConfig, ReviewError, ReviewRunContext,
    collect_changed_files, run_review,
};

const DEFAULT_CONFIG_PATH: &str = ".ai-review.yml";

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine in CI; variables come from the runner.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            exit_code_for(&e)
        }
    }
}

async fn run() -> Result<ExitCode, anyhow::Error> {
    let env: BTreeMap<String, String> = std::env::vars().collect();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(Path::new(&config_path))?;

    let workspace = workspace_dir(&env);
    let forge = forge_context_from_env(&env)?;
    let (base_ref, head_ref) = diff_refs(&env, &forge);

    info!(
        config = %config_path,
        workspace = %workspace.display(),
        base = %base_ref,
        "collecting changed files"
    );
    let diff_files = collect_changed_files(&workspace, &base_ref, &head_ref)
        .await
        .context("failed to collect the diff from the workspace checkout")?;
    info!(files = diff_files.len(), "diff collected");

    let dry_run = env_bool(&env, "REVIEW_DRY_RUN", false);
    let cache_dir = match env.get("REVIEW_CACHE_DIR") {
        Some(dir) if dir.is_empty() => None,
        Some(dir) => Some(PathBuf::from(dir)),
        None => Some(workspace.join(".review-cache")),
    };

    let ctx = ReviewRunContext {
        config,
        forge,
        env,
        diff_files,
        cache_dir,
        dry_run,
    };

    // Cancellation: Ctrl-C cancels the run; agents abort, partial results
    // publish, and we exit 4.
    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested");
            watcher.cancel();
        }
    });

    match run_review(ctx, cancel).await {
        Ok(report) => {
            if let Some(reason) = &report.skipped {
                println!("{} {reason}", "review skipped:".yellow().bold());
                return Ok(ExitCode::SUCCESS);
            }
            for status in &report.statuses {
                let line = format!(
                    "{} [{}] {:?}{}",
                    status.agent,
                    status.pass,
                    status.state,
                    status
                        .detail
                        .as_deref()
                        .map(|d| format!(" — {d}"))
                        .unwrap_or_default(),
                );
                match status.state {
                    review_pipeline::AgentState::Failure => println!("{}", line.red()),
                    review_pipeline::AgentState::Skipped => println!("{}", line.yellow()),
                    _ => println!("{}", line.green()),
                }
            }
            let findings = report.publish.as_ref().map(|p| p.findings_total).unwrap_or(0);
            match report.conclusion {
                Some(review_pipeline::forge::CheckConclusion::Failure) => {
                    println!("{} {findings} finding(s)", "review failed:".red().bold());
                }
                _ => {
                    println!("{} {findings} finding(s)", "review passed:".green().bold());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{} {e}", "review error:".red().bold());
            Ok(review_exit_code(&e))
        }
    }
}

fn load_config(path: &Path) -> Result<ReviewConfig, anyhow::Error> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    let config: ReviewConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("invalid config in {}", path.display()))?;
    config.validate().context("config failed validation")?;
    Ok(config)
}

/// Detect the hosting CI and assemble forge coordinates from its standard
/// environment variables.
fn forge_context_from_env(env: &BTreeMap<String, String>) -> Result<ForgeContext, anyhow::Error> {
    let get = |k: &str| env.get(k).cloned().unwrap_or_default();

    if get("GITHUB_ACTIONS") == "true" {
        let repository = get("GITHUB_REPOSITORY");
        let (owner, repo) = repository
            .split_once('/')
            .context("GITHUB_REPOSITORY is not owner/repo")?;
        let token = get("GITHUB_TOKEN");
        if token.is_empty() {
            bail!("GITHUB_TOKEN is not set");
        }
        return Ok(ForgeContext::GitHub(GitHubContext {
            owner: owner.to_string(),
            repo: repo.to_string(),
            pr_number: pr_number_from_github_ref(&get("GITHUB_REF")),
            head_sha: get("GITHUB_SHA"),
            token,
        }));
    }

    if get("TF_BUILD").eq_ignore_ascii_case("true") {
        // SYSTEM_ACCESSTOKEN is preferred; a PAT is the fallback.
        let token = match env.get("SYSTEM_ACCESSTOKEN").filter(|t| !t.is_empty()) {
            Some(token) => token.clone(),
            None => get("AZURE_DEVOPS_PAT"),
        };
        if token.is_empty() {
            bail!("neither SYSTEM_ACCESSTOKEN nor AZURE_DEVOPS_PAT is set");
        }
        return Ok(ForgeContext::Ado(AdoContext {
            collection_url: get("SYSTEM_COLLECTIONURI").trim_end_matches('/').to_string(),
            project: get("SYSTEM_TEAMPROJECT"),
            repository: get("BUILD_REPOSITORY_NAME"),
            pr_number: env
                .get("SYSTEM_PULLREQUEST_PULLREQUESTID")
                .and_then(|v| v.parse().ok()),
            head_sha: get("BUILD_SOURCEVERSION"),
            token,
        }));
    }

    bail!("no supported CI detected (expected GitHub Actions or Azure Pipelines)")
}

/// "refs/pull/123/merge" → 123.
fn pr_number_from_github_ref(github_ref: &str) -> Option<u64> {
    github_ref
        .strip_prefix("refs/pull/")?
        .split('/')
        .next()?
        .parse()
        .ok()
}

fn workspace_dir(env: &BTreeMap<String, String>) -> PathBuf {
    env.get("GITHUB_WORKSPACE")
        .or_else(|| env.get("BUILD_SOURCESDIRECTORY"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Pick the diff base: the PR target branch when present, the previous
/// commit in push mode.
fn diff_refs(env: &BTreeMap<String, String>, forge: &ForgeContext) -> (String, String) {
    let base = match forge {
        ForgeContext::GitHub(c) if c.pr_number.is_some() => {
            let branch = env.get("GITHUB_BASE_REF").cloned().unwrap_or_default();
            if branch.is_empty() {
                "HEAD~1".to_string()
            } else {
                format!("origin/{branch}")
            }
        }
        ForgeContext::Ado(c) if c.pr_number.is_some() => {
            let target = env
                .get("SYSTEM_PULLREQUEST_TARGETBRANCH")
                .cloned()
                .unwrap_or_default();
            match target.strip_prefix("refs/heads/") {
                Some(branch) => format!("origin/{branch}"),
                None if !target.is_empty() => target,
                None => "HEAD~1".to_string(),
            }
        }
        _ => "HEAD~1".to_string(),
    };
    (base, "HEAD".to_string())
}

fn env_bool(env: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    env.get(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn review_exit_code(e: &ReviewError) -> ExitCode {
    match e {
        ReviewError::Budget(_) => ExitCode::from(2),
        ReviewError::Forge(_) => ExitCode::from(3),
        ReviewError::Cancelled => ExitCode::from(4),
        _ => ExitCode::from(1),
    }
}

fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<ReviewError>() {
        Some(review) => review_exit_code(review),
        None => ExitCode::from(1),
    }
}
