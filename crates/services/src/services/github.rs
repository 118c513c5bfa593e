use std::{env, time::Duration};

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use ts_rs::TS;

const GITHUB_API: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum GitHubServiceError {
    #[error("GitHub App not configured")]
    NotConfigured,
    #[error("GitHub authentication failed: {0}")]
    AuthFailed(String),
    #[error("GitHub request failed: {0}")]
    Network(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("GitHub rejected the request: {0}")]
    Rejected(String),
    #[error("Unexpected GitHub response: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for GitHubServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            GitHubServiceError::Network(err.to_string())
        } else {
            GitHubServiceError::UnexpectedResponse(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct PullRequestInfo {
    pub number: i64,
    pub url: String,
    pub title: String,
    pub draft: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ReviewSummary {
    pub user: Option<String>,
    pub state: Option<String>,
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CheckSummary {
    pub name: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct PrStatus {
    pub pr_number: i64,
    pub pr_url: Option<String>,
    pub state: Option<String>,
    pub merged: bool,
    pub mergeable: Option<bool>,
    pub draft: bool,
    pub title: Option<String>,
    pub head_branch: Option<String>,
    pub base_branch: Option<String>,
    pub reviews: Vec<ReviewSummary>,
    pub checks: Vec<CheckSummary>,
    pub ci_status: String,
    pub ready_to_merge: bool,
}

/// Parse `owner/repo` out of a GitHub remote URL (https or ssh form).
pub fn parse_repo_url(repo_url: &str) -> Option<(String, String)> {
    let re = Regex::new(r"github\.com[/:]([^/]+)/([^/\.]+)").ok()?;
    let caps = re.captures(repo_url)?;
    let owner = caps.get(1)?.as_str().to_string();
    let repo = caps.get(2)?.as_str().trim_end_matches(".git").to_string();
    Some((owner, repo))
}

/// Overall CI state for a set of check runs: none / pending / passing / failing.
pub fn compute_ci_status(checks: &[CheckSummary]) -> &'static str {
    if checks.is_empty() {
        return "none";
    }
    let any_pending = checks.iter().any(|c| c.status.as_deref() != Some("completed"));
    if any_pending {
        return "pending";
    }
    let all_passed = checks
        .iter()
        .filter(|c| c.status.as_deref() == Some("completed"))
        .all(|c| c.conclusion.as_deref() == Some("success"));
    if all_passed { "passing" } else { "failing" }
}

/// A PR is mergeable when it is open, not a draft, GitHub reports it
/// mergeable, CI is passing, and at least one review approved.
pub fn compute_ready_to_merge(
    state: Option<&str>,
    draft: bool,
    mergeable: Option<bool>,
    ci_status: &str,
    reviews: &[ReviewSummary],
) -> bool {
    state == Some("open")
        && !draft
        && mergeable == Some(true)
        && ci_status == "passing"
        && reviews.iter().any(|r| r.state.as_deref() == Some("APPROVED"))
}

/// Thin client over the GitHub App REST API. App credentials come from
/// `GITHUB_APP_ID` / `GITHUB_APP_PRIVATE_KEY`; without them only the
/// env-token and public-URL fallbacks in WorkspaceManager apply.
#[derive(Clone)]
pub struct GitHubService {
    client: reqwest::Client,
    app_id: Option<String>,
    private_key: Option<String>,
}

impl Default for GitHubService {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubService {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("djinnbot")
            .build()
            .expect("reqwest client");
        Self {
            client,
            app_id: env::var("GITHUB_APP_ID").ok(),
            private_key: env::var("GITHUB_APP_PRIVATE_KEY").ok(),
        }
    }

    pub fn app_configured(&self) -> bool {
        self.app_id.is_some() && self.private_key.is_some()
    }

    fn generate_jwt(&self) -> Result<String, GitHubServiceError> {
        let app_id = self.app_id.as_ref().ok_or(GitHubServiceError::NotConfigured)?;
        let pem = self
            .private_key
            .as_ref()
            .ok_or(GitHubServiceError::NotConfigured)?;
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - 60,
            exp: now + 540,
            iss: app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| GitHubServiceError::AuthFailed(format!("invalid app key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| GitHubServiceError::AuthFailed(format!("jwt signing failed: {e}")))
    }

    async fn api_get(&self, token: &str, path: &str) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .get(format!("{GITHUB_API}{path}"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
    }

    /// Mint an installation access token.
    pub async fn installation_token(
        &self,
        installation_id: i64,
    ) -> Result<String, GitHubServiceError> {
        let jwt = self.generate_jwt()?;
        let resp = self
            .client
            .post(format!(
                "{GITHUB_API}/app/installations/{installation_id}/access_tokens"
            ))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;

        match resp.status().as_u16() {
            201 => {
                let body: Value = resp.json().await?;
                body.get("token")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| {
                        GitHubServiceError::UnexpectedResponse(
                            "installation token response missing token".into(),
                        )
                    })
            }
            401 | 403 => Err(GitHubServiceError::AuthFailed(format!(
                "installation token request returned {}",
                resp.status()
            ))),
            _ => Err(GitHubServiceError::UnexpectedResponse(format!(
                "installation token request returned {}",
                resp.status()
            ))),
        }
    }

    /// Iterate App installations and probe `/repos/{owner}/{repo}` with each
    /// installation's token; the first 200 wins.
    pub async fn discover_installation(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Option<i64>, GitHubServiceError> {
        if !self.app_configured() {
            return Ok(None);
        }
        let jwt = self.generate_jwt()?;
        let resp = self
            .client
            .get(format!("{GITHUB_API}/app/installations"))
            .bearer_auth(&jwt)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;
        if resp.status().as_u16() != 200 {
            return Ok(None);
        }
        let installations: Vec<Value> = resp.json().await?;

        for install in installations {
            let Some(id) = install.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let Ok(token) = self.installation_token(id).await else {
                continue;
            };
            let probe = self.api_get(&token, &format!("/repos/{owner}/{repo}")).await?;
            if probe.status().as_u16() == 200 {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Open a pull request. Errors distinguish auth (401/403), missing
    /// repo/branch (404), and rejected requests (422, e.g. no commits
    /// between branches or a PR that already exists).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_pull_request(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PullRequestInfo, GitHubServiceError> {
        let resp = self
            .client
            .post(format!("{GITHUB_API}/repos/{owner}/{repo}/pulls"))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .json(&json!({
                "title": title,
                "head": head_branch,
                "base": base_branch,
                "body": body,
                "draft": draft,
            }))
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 201 => {
                let pr: Value = resp.json().await?;
                Ok(PullRequestInfo {
                    number: pr.get("number").and_then(Value::as_i64).unwrap_or_default(),
                    url: pr
                        .get("html_url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    title: pr
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or(title)
                        .to_string(),
                    draft: pr.get("draft").and_then(Value::as_bool).unwrap_or(draft),
                })
            }
            401 | 403 => Err(GitHubServiceError::AuthFailed(
                "authentication failed creating pull request".into(),
            )),
            404 => Err(GitHubServiceError::NotFound(format!(
                "repository {owner}/{repo} or branch {head_branch} not found"
            ))),
            422 => {
                let detail: Value = resp.json().await.unwrap_or_default();
                Err(GitHubServiceError::Rejected(
                    detail
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("validation failed")
                        .to_string(),
                ))
            }
            status => Err(GitHubServiceError::UnexpectedResponse(format!(
                "create pull request returned {status}"
            ))),
        }
    }

    /// Resolve the full status of a pull request: metadata, reviews and
    /// check-runs, collapsed into `ci_status` and `ready_to_merge`.
    pub async fn pr_status(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        pr_number: i64,
    ) -> Result<PrStatus, GitHubServiceError> {
        let resp = self
            .api_get(token, &format!("/repos/{owner}/{repo}/pulls/{pr_number}"))
            .await?;
        match resp.status().as_u16() {
            200 => {}
            404 => {
                return Err(GitHubServiceError::NotFound(format!(
                    "PR #{pr_number} not found on GitHub"
                )));
            }
            401 | 403 => {
                return Err(GitHubServiceError::AuthFailed(format!(
                    "fetching PR #{pr_number} returned {}",
                    resp.status()
                )));
            }
            status => {
                return Err(GitHubServiceError::UnexpectedResponse(format!(
                    "fetching PR returned {status}"
                )));
            }
        }
        let pr: Value = resp.json().await?;

        let reviews: Vec<ReviewSummary> = match self
            .api_get(
                token,
                &format!("/repos/{owner}/{repo}/pulls/{pr_number}/reviews"),
            )
            .await
        {
            Ok(resp) if resp.status().as_u16() == 200 => {
                let raw: Vec<Value> = resp.json().await.unwrap_or_default();
                raw.iter()
                    .map(|r| ReviewSummary {
                        user: r
                            .pointer("/user/login")
                            .and_then(Value::as_str)
                            .map(String::from),
                        state: r.get("state").and_then(Value::as_str).map(String::from),
                        submitted_at: r
                            .get("submitted_at")
                            .and_then(Value::as_str)
                            .map(String::from),
                    })
                    .collect()
            }
            _ => Vec::new(),
        };

        let head_sha = pr.pointer("/head/sha").and_then(Value::as_str).unwrap_or("");
        let checks: Vec<CheckSummary> = if head_sha.is_empty() {
            Vec::new()
        } else {
            match self
                .api_get(
                    token,
                    &format!("/repos/{owner}/{repo}/commits/{head_sha}/check-runs"),
                )
                .await
            {
                Ok(resp) if resp.status().as_u16() == 200 => {
                    let raw: Value = resp.json().await.unwrap_or_default();
                    raw.get("check_runs")
                        .and_then(Value::as_array)
                        .map(|runs| {
                            runs.iter()
                                .map(|c| CheckSummary {
                                    name: c.get("name").and_then(Value::as_str).map(String::from),
                                    status: c
                                        .get("status")
                                        .and_then(Value::as_str)
                                        .map(String::from),
                                    conclusion: c
                                        .get("conclusion")
                                        .and_then(Value::as_str)
                                        .map(String::from),
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                }
                _ => Vec::new(),
            }
        };

        let state = pr.get("state").and_then(Value::as_str).map(String::from);
        let draft = pr.get("draft").and_then(Value::as_bool).unwrap_or(false);
        let mergeable = pr.get("mergeable").and_then(Value::as_bool);
        let ci_status = compute_ci_status(&checks).to_string();
        let ready_to_merge =
            compute_ready_to_merge(state.as_deref(), draft, mergeable, &ci_status, &reviews);

        Ok(PrStatus {
            pr_number,
            pr_url: pr.get("html_url").and_then(Value::as_str).map(String::from),
            state,
            merged: pr.get("merged").and_then(Value::as_bool).unwrap_or(false),
            mergeable,
            draft,
            title: pr.get("title").and_then(Value::as_str).map(String::from),
            head_branch: pr
                .pointer("/head/ref")
                .and_then(Value::as_str)
                .map(String::from),
            base_branch: pr
                .pointer("/base/ref")
                .and_then(Value::as_str)
                .map(String::from),
            reviews,
            checks,
            ci_status,
            ready_to_merge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(status: &str, conclusion: Option<&str>) -> CheckSummary {
        CheckSummary {
            name: Some("build".into()),
            status: Some(status.into()),
            conclusion: conclusion.map(String::from),
        }
    }

    fn approved() -> ReviewSummary {
        ReviewSummary {
            user: Some("reviewer".into()),
            state: Some("APPROVED".into()),
            submitted_at: None,
        }
    }

    #[test]
    fn parse_repo_urls() {
        assert_eq!(
            parse_repo_url("https://github.com/acme/widget.git"),
            Some(("acme".into(), "widget".into()))
        );
        assert_eq!(
            parse_repo_url("git@github.com:acme/widget.git"),
            Some(("acme".into(), "widget".into()))
        );
        assert_eq!(parse_repo_url("https://gitlab.com/acme/widget"), None);
    }

    #[test]
    fn ci_status_resolution() {
        assert_eq!(compute_ci_status(&[]), "none");
        assert_eq!(compute_ci_status(&[check("in_progress", None)]), "pending");
        assert_eq!(
            compute_ci_status(&[check("completed", Some("success"))]),
            "passing"
        );
        assert_eq!(
            compute_ci_status(&[
                check("completed", Some("success")),
                check("completed", Some("failure"))
            ]),
            "failing"
        );
        assert_eq!(
            compute_ci_status(&[
                check("completed", Some("success")),
                check("queued", None)
            ]),
            "pending"
        );
    }

    #[test]
    fn ready_to_merge_requires_every_condition() {
        let reviews = vec![approved()];
        assert!(compute_ready_to_merge(
            Some("open"),
            false,
            Some(true),
            "passing",
            &reviews
        ));
        assert!(!compute_ready_to_merge(
            Some("closed"),
            false,
            Some(true),
            "passing",
            &reviews
        ));
        assert!(!compute_ready_to_merge(
            Some("open"),
            true,
            Some(true),
            "passing",
            &reviews
        ));
        assert!(!compute_ready_to_merge(
            Some("open"),
            false,
            Some(false),
            "passing",
            &reviews
        ));
        assert!(!compute_ready_to_merge(
            Some("open"),
            false,
            Some(true),
            "failing",
            &reviews
        ));
        assert!(!compute_ready_to_merge(
            Some("open"),
            false,
            Some(true),
            "passing",
            &[]
        ));
    }
}
