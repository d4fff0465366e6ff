use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{IibError, Result};

/// A merge request opened for one request's catalog changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub iid: u64,
    pub web_url: String,
    pub repo_url: String,
    pub source_branch: String,
}

/// Opens and closes merge requests on the Git hosting service
#[async_trait]
pub trait MergeRequestProvider: Send + Sync {
    async fn create_merge_request(
        &self,
        repo_url: &str,
        token: &str,
        source_branch: &str,
        target_branch: &str,
        request_id: u64,
    ) -> Result<MergeRequest>;

    async fn close_merge_request(&self, mr: &MergeRequest, token: &str) -> Result<()>;
}

/// GitLab REST API (`/api/v4`) client
pub struct GitLabClient {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CreatedMergeRequest {
    iid: u64,
    web_url: String,
}

impl GitLabClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// API base URL and project path of an `https://` GitLab repository URL
pub fn extract_gitlab_info(repo_url: &str) -> Result<(String, String)> {
    let parsed = url::Url::parse(repo_url)
        .map_err(|_| IibError::iib(format!("Invalid GitLab repository URL format: {}", repo_url)))?;
    if parsed.scheme() != "https" {
        return Err(IibError::iib(format!(
            "Unsupported repository URL format: {}",
            repo_url
        )));
    }
    let host = match parsed.host_str() {
        Some(host) => match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        },
        None => {
            return Err(IibError::iib(format!(
                "Invalid GitLab repository URL format: {}",
                repo_url
            )))
        }
    };

    let path = parsed.path().trim_start_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    if path.is_empty() {
        return Err(IibError::iib(format!(
            "Invalid GitLab repository URL format: {}",
            repo_url
        )));
    }
    Ok((format!("https://{}/api/v4", host), path.to_string()))
}

fn merge_requests_url(repo_url: &str) -> Result<String> {
    let (api_url, project_path) = extract_gitlab_info(repo_url)?;
    Ok(format!(
        "{}/projects/{}/merge_requests",
        api_url,
        urlencoding::encode(&project_path)
    ))
}

#[async_trait]
impl MergeRequestProvider for GitLabClient {
    async fn create_merge_request(
        &self,
        repo_url: &str,
        token: &str,
        source_branch: &str,
        target_branch: &str,
        request_id: u64,
    ) -> Result<MergeRequest> {
        let url = merge_requests_url(repo_url)?;
        let payload = json!({
            "source_branch": source_branch,
            "target_branch": target_branch,
            "title": format!("IIB: Update for request id {}", request_id),
            "description": format!("Automated merge request created by IIB for request {}", request_id),
            "remove_source_branch": true,
            "squash": true,
        });

        info!("Creating merge request via GitLab API for {}", repo_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| IibError::iib(format!("GitLab API request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                "Failed to create merge request. Status: {}, Response: {}",
                status.as_u16(),
                body
            );
            return Err(IibError::iib(format!(
                "Failed to create merge request: {}",
                status.as_u16()
            )));
        }

        let created: CreatedMergeRequest = response
            .json()
            .await
            .map_err(|e| IibError::iib(format!("GitLab API request failed: {}", e)))?;
        info!(
            "Successfully created merge request {}: {}",
            created.iid, created.web_url
        );
        Ok(MergeRequest {
            iid: created.iid,
            web_url: created.web_url,
            repo_url: repo_url.to_string(),
            source_branch: source_branch.to_string(),
        })
    }

    async fn close_merge_request(&self, mr: &MergeRequest, token: &str) -> Result<()> {
        let url = format!("{}/{}", merge_requests_url(&mr.repo_url)?, mr.iid);
        info!("Closing merge request {} via GitLab API", mr.iid);
        let response = self
            .client
            .put(&url)
            .bearer_auth(token)
            .json(&json!({"state_event": "close"}))
            .send()
            .await
            .map_err(|e| IibError::iib(format!("GitLab API request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                "Failed to close merge request. Status: {}, Response: {}",
                status.as_u16(),
                body
            );
            return Err(IibError::iib(format!(
                "Failed to close merge request: {}",
                status.as_u16()
            )));
        }
        info!("Successfully closed merge request {}", mr.iid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_gitlab_info() {
        let (api, project) = extract_gitlab_info("https://gitlab.example.com/exd/catalogs/index.git").unwrap();
        assert_eq!(api, "https://gitlab.example.com/api/v4");
        assert_eq!(project, "exd/catalogs/index");

        let (api, project) = extract_gitlab_info("https://gitlab.example.com:8443/exd/index").unwrap();
        assert_eq!(api, "https://gitlab.example.com:8443/api/v4");
        assert_eq!(project, "exd/index");
    }

    #[test]
    fn test_extract_gitlab_info_rejects_other_urls() {
        let err = extract_gitlab_info("git@gitlab.example.com:exd/index.git").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid GitLab repository URL format: git@gitlab.example.com:exd/index.git"
        );
        let err = extract_gitlab_info("http://gitlab.example.com/exd/index").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported repository URL format: http://gitlab.example.com/exd/index"
        );
        assert!(extract_gitlab_info("https://gitlab.example.com/").is_err());
    }

    #[test]
    fn test_merge_requests_url_encodes_project() {
        assert_eq!(
            merge_requests_url("https://gitlab.example.com/exd/index.git").unwrap(),
            "https://gitlab.example.com/api/v4/projects/exd%2Findex/merge_requests"
        );
    }
}
