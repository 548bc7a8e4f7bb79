//! Azure DevOps binding: commit statuses and pull-request threads.
//!
//! Endpoints used (api-version=7.1):
//! - GET   {repo}/pullRequests/{id}
//! - POST  {repo}/commits/{sha}/statuses
//! - GET   {repo}/pullRequests/{id}/threads?$top=100&$skip=N
//! - POST  {repo}/pullRequests/{id}/threads
//! - PATCH {repo}/pullRequests/{id}/threads/{tid}/comments/{cid}
//!
//! Inline thread ids are addressed as "<threadId>/<commentId>" by the
//! provider-neutral layer. Paths in threadContext are rooted with a leading
//! slash as the API expects; everything else in the pipeline stays canonical.

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::errors::ForgeError;
use crate::findings::fingerprint::extract_markers;
use crate::forge::{
    AdoContext, CheckConclusion, CheckHandle, ExistingComment, InlineComment, PrMeta, with_retries,
};

const API_VERSION: &str = "7.1";
const STATUS_CONTEXT_NAME: &str = "AI Code Review";
const STATUS_CONTEXT_GENRE: &str = "ci";
const THREADS_PAGE_SIZE: u32 = 100;

pub struct AdoForge {
    http: reqwest::Client,
    headers: HeaderMap,
    ctx: AdoContext,
    /// Wire code for new threads: 1 = Active, 6 = Pending (config-driven).
    pub thread_status: u8,
}

impl AdoForge {
    pub fn new(http: reqwest::Client, ctx: AdoContext) -> Result<Self, ForgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", ctx.token))
                .map_err(|e| ForgeError::InvalidResponse(format!("bad token header: {e}")))?,
        );
        Ok(Self {
            http,
            headers,
            ctx,
            thread_status: 1,
        })
    }

    fn repo_base(&self) -> String {
        format!(
            "{}/{}/_apis/git/repositories/{}",
            self.ctx.collection_url.trim_end_matches('/'),
            urlencoding::encode(&self.ctx.project),
            urlencoding::encode(&self.ctx.repository),
        )
    }

    fn pr_number(&self) -> Result<u64, ForgeError> {
        self.ctx
            .pr_number
            .ok_or_else(|| ForgeError::InvalidResponse("no PR id in context".into()))
    }

    pub async fn fetch_pr_meta(&self) -> Result<PrMeta, ForgeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Commit {
            commit_id: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Pull {
            title: Option<String>,
            #[serde(default)]
            is_draft: bool,
            last_merge_source_commit: Option<Commit>,
        }

        let url = format!(
            "{}/pullRequests/{}?api-version={API_VERSION}",
            self.repo_base(),
            self.pr_number()?
        );
        let pull: Pull = with_retries("ado_pr_meta", || self.get_json(&url)).await?;
        Ok(PrMeta {
            title: pull.title.unwrap_or_default(),
            draft: pull.is_draft,
            // Fork detection on ADO is environment-based, not API-based.
            source_repo: None,
            target_repo: None,
            head_sha: pull.last_merge_source_commit.map(|c| c.commit_id),
        })
    }

    pub async fn start_status(&self, title: &str) -> Result<CheckHandle, ForgeError> {
        self.post_status("pending", title).await?;
        Ok(CheckHandle { id: None })
    }

    pub async fn complete_status(
        &self,
        conclusion: CheckConclusion,
        title: &str,
    ) -> Result<(), ForgeError> {
        let state = match conclusion {
            CheckConclusion::Failure => "failed",
            CheckConclusion::Success | CheckConclusion::Neutral => "succeeded",
        };
        self.post_status(state, title).await
    }

    async fn post_status(&self, state: &str, description: &str) -> Result<(), ForgeError> {
        let url = format!(
            "{}/commits/{}/statuses?api-version={API_VERSION}",
            self.repo_base(),
            self.ctx.head_sha
        );
        let body = serde_json::json!({
            "state": state,
            "description": description,
            "context": { "name": STATUS_CONTEXT_NAME, "genre": STATUS_CONTEXT_GENRE },
        });
        debug!(state, "ado: post commit status");
        with_retries("ado_post_status", || async {
            let _: serde_json::Value = self.post_json(&url, &body).await?;
            Ok(())
        })
        .await
    }

    /// Page through every thread; empty page terminates.
    async fn list_threads(&self) -> Result<Vec<Thread>, ForgeError> {
        let base = format!("{}/pullRequests/{}/threads", self.repo_base(), self.pr_number()?);
        let mut out: Vec<Thread> = Vec::new();
        let mut skip = 0u32;
        loop {
            let url = format!(
                "{base}?api-version={API_VERSION}&$top={THREADS_PAGE_SIZE}&$skip={skip}"
            );
            let page: ThreadPage =
                with_retries("ado_list_threads", || self.get_json(&url)).await?;
            if page.value.is_empty() {
                break;
            }
            let count = page.value.len() as u32;
            out.extend(page.value);
            if count < THREADS_PAGE_SIZE {
                break;
            }
            skip += THREADS_PAGE_SIZE;
        }
        Ok(out)
    }

    pub async fn find_summary_thread(
        &self,
        header: &str,
    ) -> Result<Option<ExistingComment>, ForgeError> {
        for thread in self.list_threads().await? {
            if thread.thread_context.is_some() {
                continue;
            }
            let Some(first) = thread.comments.first() else {
                continue;
            };
            let body = first.content.clone().unwrap_or_default();
            if body.lines().next().map(str::trim) == Some(header.trim()) {
                let markers = extract_markers(&body);
                return Ok(Some(ExistingComment {
                    id: format!("{}/{}", thread.id, first.id),
                    body,
                    file: None,
                    line: None,
                    markers,
                }));
            }
        }
        Ok(None)
    }

    pub async fn create_summary_thread(&self, body: &str) -> Result<(), ForgeError> {
        let url = format!(
            "{}/pullRequests/{}/threads?api-version={API_VERSION}",
            self.repo_base(),
            self.pr_number()?
        );
        let payload = serde_json::json!({
            "comments": [{ "content": body, "commentType": 1 }],
            "status": self.thread_status,
        });
        debug!("ado: create summary thread");
        with_retries("ado_create_summary", || async {
            let _: serde_json::Value = self.post_json(&url, &payload).await?;
            Ok(())
        })
        .await
    }

    /// Threads carrying file context; markers come from the first comment.
    pub async fn list_inline_threads(&self) -> Result<Vec<ExistingComment>, ForgeError> {
        let mut out = Vec::new();
        for thread in self.list_threads().await? {
            let Some(ctx) = &thread.thread_context else {
                continue;
            };
            let Some(first) = thread.comments.first() else {
                continue;
            };
            let body = first.content.clone().unwrap_or_default();
            let markers = extract_markers(&body);
            out.push(ExistingComment {
                id: format!("{}/{}", thread.id, first.id),
                body,
                file: ctx
                    .file_path
                    .as_deref()
                    .map(|p| p.trim_start_matches('/').to_string()),
                line: ctx.right_file_start.as_ref().map(|p| p.line),
                markers,
            });
        }
        Ok(out)
    }

    pub async fn post_inline(&self, comment: &InlineComment) -> Result<(), ForgeError> {
        let url = format!(
            "{}/pullRequests/{}/threads?api-version={API_VERSION}",
            self.repo_base(),
            self.pr_number()?
        );
        let end_line = comment.end_line.unwrap_or(comment.line);
        let payload = serde_json::json!({
            "comments": [{ "content": comment.body, "commentType": 1 }],
            "status": self.thread_status,
            "threadContext": {
                "filePath": format!("/{}", comment.file),
                "rightFileStart": { "line": comment.line, "offset": 1 },
                "rightFileEnd": { "line": end_line, "offset": 1 },
            },
        });
        debug!(file = %comment.file, line = comment.line, "ado: create inline thread");
        with_retries("ado_post_inline", || async {
            let _: serde_json::Value = self.post_json(&url, &payload).await?;
            Ok(())
        })
        .await
    }

    /// Update one comment addressed as "<threadId>/<commentId>".
    pub async fn update_comment(&self, id: &str, body: &str) -> Result<(), ForgeError> {
        let (thread_id, comment_id) = id
            .split_once('/')
            .ok_or_else(|| ForgeError::InvalidResponse(format!("bad ado comment id '{id}'")))?;
        let url = format!(
            "{}/pullRequests/{}/threads/{thread_id}/comments/{comment_id}?api-version={API_VERSION}",
            self.repo_base(),
            self.pr_number()?
        );
        let payload = serde_json::json!({ "content": body });
        with_retries("ado_update_comment", || async {
            let resp = self
                .http
                .patch(&url)
                .headers(self.headers.clone())
                .json(&payload)
                .send()
                .await?;
            check_status(&resp)?;
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
        check_status(&resp)?;
        Ok(resp.json().await?)
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
        check_status(&resp)?;
        Ok(resp.json().await?)
    }
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

// ------------------------- wire shapes -------------------------

#[derive(Deserialize)]
struct ThreadPage {
    #[serde(default)]
    value: Vec<Thread>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Thread {
    id: u64,
    #[serde(default)]
    comments: Vec<ThreadComment>,
    thread_context: Option<ThreadContext>,
}

#[derive(Deserialize)]
struct ThreadComment {
    id: u64,
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadContext {
    file_path: Option<String>,
    right_file_start: Option<FilePosition>,
}

#[derive(Deserialize)]
struct FilePosition {
    line: u32,
}
