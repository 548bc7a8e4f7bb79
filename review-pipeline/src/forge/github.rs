//! GitHub binding: check runs, issue comments, review comments.
//!
//! Endpoints used:
//! - GET   /repos/{owner}/{repo}/pulls/{number}
//! - POST  /repos/{owner}/{repo}/check-runs
//! - PATCH /repos/{owner}/{repo}/check-runs/{id}
//! - GET   /repos/{owner}/{repo}/issues/{number}/comments
//! - POST  /repos/{owner}/{repo}/issues/{number}/comments
//! - PATCH /repos/{owner}/{repo}/issues/comments/{id}
//! - GET   /repos/{owner}/{repo}/pulls/{number}/comments
//! - POST  /repos/{owner}/{repo}/pulls/{number}/comments
//! - PATCH /repos/{owner}/{repo}/pulls/comments/{id}

use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::errors::ForgeError;
use crate::findings::fingerprint::extract_markers;
use crate::forge::{
    Annotation, CheckConclusion, CheckHandle, ExistingComment, GitHubContext, InlineComment,
    MAX_CHECK_ANNOTATIONS, PrMeta, with_retries,
};

const BASE_API: &str = "https://api.github.com";
const CHECK_NAME: &str = "AI Code Review";

pub struct GitHubForge {
    http: reqwest::Client,
    headers: HeaderMap,
    ctx: GitHubContext,
}

impl GitHubForge {
    pub fn new(http: reqwest::Client, ctx: GitHubContext) -> Result<Self, ForgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", ctx.token))
                .map_err(|e| ForgeError::InvalidResponse(format!("bad token header: {e}")))?,
        );
        Ok(Self { http, headers, ctx })
    }

    fn repo_url(&self, tail: &str) -> String {
        format!("{BASE_API}/repos/{}/{}/{tail}", self.ctx.owner, self.ctx.repo)
    }

    fn pr_number(&self) -> Result<u64, ForgeError> {
        self.ctx
            .pr_number
            .ok_or_else(|| ForgeError::InvalidResponse("no PR number in context".into()))
    }

    pub async fn fetch_pr_meta(&self) -> Result<PrMeta, ForgeError> {
        #[derive(Deserialize)]
        struct Repo {
            full_name: String,
        }
        #[derive(Deserialize)]
        struct Side {
            sha: Option<String>,
            repo: Option<Repo>,
        }
        #[derive(Deserialize)]
        struct Pull {
            title: String,
            #[serde(default)]
            draft: bool,
            head: Side,
            base: Side,
        }

        let url = self.repo_url(&format!("pulls/{}", self.pr_number()?));
        let pull: Pull = with_retries("github_pr_meta", || self.get_json(&url)).await?;
        Ok(PrMeta {
            title: pull.title,
            draft: pull.draft,
            source_repo: pull.head.repo.map(|r| r.full_name),
            target_repo: pull.base.repo.map(|r| r.full_name),
            head_sha: pull.head.sha,
        })
    }

    pub async fn start_check(&self, title: &str) -> Result<CheckHandle, ForgeError> {
        #[derive(Deserialize)]
        struct CheckRun {
            id: u64,
        }
        let url = self.repo_url("check-runs");
        let body = serde_json::json!({
            "name": CHECK_NAME,
            "head_sha": self.ctx.head_sha,
            "status": "in_progress",
            "started_at": Utc::now().to_rfc3339(),
            "output": { "title": title, "summary": "" },
        });
        debug!(head_sha = %self.ctx.head_sha, "github: create check run");
        let run: CheckRun = with_retries("github_start_check", || self.post_json(&url, &body)).await?;
        Ok(CheckHandle { id: Some(run.id) })
    }

    pub async fn complete_check(
        &self,
        handle: Option<&CheckHandle>,
        conclusion: CheckConclusion,
        title: &str,
        summary: &str,
        annotations: &[Annotation],
    ) -> Result<(), ForgeError> {
        let annotations = &annotations[..annotations.len().min(MAX_CHECK_ANNOTATIONS)];
        let output = serde_json::json!({
            "title": title,
            "summary": summary,
            "annotations": annotations,
        });

        match handle.and_then(|h| h.id) {
            Some(id) => {
                let url = self.repo_url(&format!("check-runs/{id}"));
                let body = serde_json::json!({
                    "status": "completed",
                    "conclusion": conclusion.as_github_str(),
                    "completed_at": Utc::now().to_rfc3339(),
                    "output": output,
                });
                debug!(id, conclusion = conclusion.as_github_str(), "github: complete check run");
                with_retries("github_complete_check", || {
                    self.patch_unit(&url, &body)
                })
                .await
            }
            None => {
                // The in-progress create failed earlier: create completed.
                let url = self.repo_url("check-runs");
                let body = serde_json::json!({
                    "name": CHECK_NAME,
                    "head_sha": self.ctx.head_sha,
                    "status": "completed",
                    "conclusion": conclusion.as_github_str(),
                    "completed_at": Utc::now().to_rfc3339(),
                    "output": output,
                });
                debug!("github: create-on-complete check run");
                with_retries("github_complete_check", || async {
                    let _: serde_json::Value = self.post_json(&url, &body).await?;
                    Ok(())
                })
                .await
            }
        }
    }

    pub async fn find_summary_comment(
        &self,
        header: &str,
    ) -> Result<Option<ExistingComment>, ForgeError> {
        #[derive(Deserialize)]
        struct IssueComment {
            id: u64,
            body: Option<String>,
        }
        let number = self.pr_number()?;
        let mut page = 1u32;
        loop {
            let url = self.repo_url(&format!(
                "issues/{number}/comments?per_page=100&page={page}"
            ));
            let comments: Vec<IssueComment> =
                with_retries("github_list_issue_comments", || self.get_json(&url)).await?;
            if comments.is_empty() {
                return Ok(None);
            }
            for c in &comments {
                let body = c.body.clone().unwrap_or_default();
                if body.lines().next().map(str::trim) == Some(header.trim()) {
                    let markers = extract_markers(&body);
                    return Ok(Some(ExistingComment {
                        id: c.id.to_string(),
                        body,
                        file: None,
                        line: None,
                        markers,
                    }));
                }
            }
            page += 1;
        }
    }

    pub async fn create_summary_comment(&self, body: &str) -> Result<(), ForgeError> {
        let url = self.repo_url(&format!("issues/{}/comments", self.pr_number()?));
        let payload = serde_json::json!({ "body": body });
        with_retries("github_create_summary", || async {
            let _: serde_json::Value = self.post_json(&url, &payload).await?;
            Ok(())
        })
        .await
    }

    /// Update an issue or review comment body. Review-comment ids and issue
    /// comment ids live in different routes; try the review route first
    /// since resolution updates dominate.
    pub async fn update_comment(&self, id: &str, body: &str) -> Result<(), ForgeError> {
        let payload = serde_json::json!({ "body": body });
        let review_url = self.repo_url(&format!("pulls/comments/{id}"));
        let result = with_retries("github_update_review_comment", || {
            self.patch_unit(&review_url, &payload)
        })
        .await;
        if !matches!(result, Err(ForgeError::NotFound)) {
            return result;
        }
        let issue_url = self.repo_url(&format!("issues/comments/{id}"));
        with_retries("github_update_issue_comment", || {
            self.patch_unit(&issue_url, &payload)
        })
        .await
    }

    pub async fn list_inline_comments(&self) -> Result<Vec<ExistingComment>, ForgeError> {
        #[derive(Deserialize)]
        struct ReviewComment {
            id: u64,
            body: Option<String>,
            path: Option<String>,
            line: Option<u32>,
        }
        let number = self.pr_number()?;
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let url = self.repo_url(&format!(
                "pulls/{number}/comments?per_page=100&page={page}"
            ));
            let comments: Vec<ReviewComment> =
                with_retries("github_list_review_comments", || self.get_json(&url)).await?;
            if comments.is_empty() {
                break;
            }
            for c in comments {
                let body = c.body.unwrap_or_default();
                let markers = extract_markers(&body);
                out.push(ExistingComment {
                    id: c.id.to_string(),
                    body,
                    file: c.path,
                    line: c.line,
                    markers,
                });
            }
            page += 1;
        }
        Ok(out)
    }

    pub async fn post_inline(&self, comment: &InlineComment) -> Result<(), ForgeError> {
        let url = self.repo_url(&format!("pulls/{}/comments", self.pr_number()?));
        let mut payload = serde_json::json!({
            "body": comment.body,
            "commit_id": self.ctx.head_sha,
            "path": comment.file,
            "line": comment.end_line.unwrap_or(comment.line),
            "side": "RIGHT",
        });
        if let Some(end) = comment.end_line {
            if end > comment.line {
                payload["start_line"] = serde_json::json!(comment.line);
                payload["start_side"] = serde_json::json!("RIGHT");
            }
        }
        debug!(file = %comment.file, line = comment.line, "github: create review comment");
        with_retries("github_post_inline", || async {
            let _: serde_json::Value = self.post_json(&url, &payload).await?;
            Ok(())
        })
        .await
    }

    // ------------------------- HTTP helpers -------------------------

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ForgeError> {
        let resp = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, ForgeError> {
        let resp = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn patch_unit(&self, url: &str, body: &serde_json::Value) -> Result<(), ForgeError> {
        let resp = self
            .http
            .patch(url)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await?;
        Self::check_status(&resp)?;
        Ok(())
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ForgeError> {
        Self::check_status(&resp)?;
        Ok(resp.json().await?)
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), ForgeError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Err(match status.as_u16() {
            401 => ForgeError::Unauthorized,
            403 => ForgeError::Forbidden,
            404 => ForgeError::NotFound,
            429 => ForgeError::RateLimited {
                retry_after_secs: retry_after,
            },
            code @ 500..=599 => ForgeError::Server(code),
            code => ForgeError::HttpStatus(code),
        })
    }
}
