use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::command::{run_cmd, CommandSpec};
use crate::error::{IibError, Result};
use crate::registry::image_name;
use crate::settings::WorkerSettings;
use crate::state::WorkerState;
use crate::tasks::containerized::gitlab::MergeRequest;

const COMMIT_USER_NAME: &str = "IIB Worker";
const COMMIT_USER_EMAIL: &str = "iib-worker@redhat.com";

/// Git repository holding the catalog of `from_index`, keyed by the image name without tag
pub fn resolve_git_url(from_index: &str, index_repo_map: &BTreeMap<String, String>) -> Option<String> {
    let name = image_name(from_index);
    let repo = index_repo_map.get(name).cloned();
    if repo.is_none() {
        warn!("Missing key '{}' in 'index_to_gitlab_push_map'", name);
    }
    repo
}

/// `(token_name, token)` configured for `repo_url`
pub fn get_git_token(settings: &WorkerSettings, repo_url: &str) -> Result<(String, String)> {
    let value = settings
        .iib_index_configs_gitlab_tokens_map
        .get(repo_url)
        .ok_or_else(|| {
            IibError::iib(format!(
                "Missing key '{}' in 'iib_index_configs_gitlab_tokens_map'",
                repo_url
            ))
        })?;
    let mut parts = value.split(':');
    match (parts.next(), parts.next()) {
        (Some(name), Some(token)) if !name.is_empty() && !token.is_empty() => {
            Ok((name.to_string(), token.to_string()))
        }
        _ => Err(IibError::iib(format!(
            "Invalid token format for '{}' in 'iib_index_configs_gitlab_tokens_map'. \
             Expected 'token_name:token_value'.",
            repo_url
        ))),
    }
}

fn git(repo: &Path) -> CommandSpec {
    CommandSpec::new("git").arg("-C").arg(repo.to_string_lossy())
}

/// Shallow clone of a single branch through a token-bearing remote
pub async fn clone_git_repo(
    state: &WorkerState,
    repo_url: &str,
    branch: &str,
    token_name: &str,
    token: &str,
    local_repo_path: &Path,
) -> Result<()> {
    let base_url = repo_url.trim_start_matches("https://");
    let remote_url = format!("https://{}:{}@{}", token_name, token, base_url);
    let clone = CommandSpec::new("git")
        .args(["clone", "--depth", "1", "--branch", branch, remote_url.as_str()])
        .arg(local_repo_path.to_string_lossy())
        .redacting(token);
    let output = run_cmd(
        state.runner(),
        &clone,
        Some(&format!("Error cloning remote repository for {}", repo_url)),
    )
    .await?;
    debug!("{}", output);

    let last_commit = run_cmd(
        state.runner(),
        &git(local_repo_path).args(["log", "-n1"]),
        Some(&format!("Error displaying last commit for {}", repo_url)),
    )
    .await?;
    info!("Most recent commit: {}", last_commit);
    Ok(())
}

/// Identity shown on the commits IIB creates
pub async fn configure_git_user(state: &WorkerState, local_repo_path: &Path) -> Result<()> {
    run_cmd(
        state.runner(),
        &git(local_repo_path).args(["config", "--local", "user.name", COMMIT_USER_NAME]),
        Some("Error configuring git user.name"),
    )
    .await?;
    run_cmd(
        state.runner(),
        &git(local_repo_path).args(["config", "--local", "user.email", COMMIT_USER_EMAIL]),
        Some("Error configuring git user.email"),
    )
    .await?;
    Ok(())
}

pub async fn stage_all(state: &WorkerState, local_repo_path: &Path) -> Result<()> {
    run_cmd(
        state.runner(),
        &git(local_repo_path).args(["add", "."]),
        Some("Error staging changes to git"),
    )
    .await?;
    let status = run_cmd(
        state.runner(),
        &git(local_repo_path).arg("status"),
        Some("Error getting git status"),
    )
    .await?;
    info!("{}", status);
    Ok(())
}

pub async fn commit_and_push(
    state: &WorkerState,
    request_id: u64,
    local_repo_path: &Path,
    repo_url: &str,
    branch: &str,
    commit_message: Option<&str>,
) -> Result<()> {
    let default_message = format!(
        "IIB: Update for request id {} (overwrite_from_index)",
        request_id
    );
    let message = commit_message.unwrap_or(&default_message);
    let output = run_cmd(
        state.runner(),
        &git(local_repo_path).args(["commit", "-m", message]),
        Some("Error committing changes"),
    )
    .await?;
    info!("{}", output);

    info!("Pushing changes to {} branch of {}", branch, repo_url);
    run_cmd(
        state.runner(),
        &git(local_repo_path).args(["push", "origin", branch]),
        Some(&format!("Error pushing changes to git repo {}", repo_url)),
    )
    .await?;
    Ok(())
}

pub async fn get_last_commit_sha(state: &WorkerState, local_repo_path: &Path) -> Result<String> {
    let sha = run_cmd(
        state.runner(),
        &git(local_repo_path).args(["rev-parse", "HEAD"]),
        Some("Error getting the last commit SHA"),
    )
    .await?;
    let sha = sha.trim();
    if sha.is_empty() {
        return Err(IibError::iib("Error getting the last commit SHA"));
    }
    Ok(sha.to_string())
}

/// Commit to `iib-request-{id}-{branch}`, push it and open a merge request into `branch`
pub async fn create_mr(
    state: &WorkerState,
    request_id: u64,
    local_repo_path: &Path,
    repo_url: &str,
    branch: &str,
    commit_message: Option<&str>,
) -> Result<MergeRequest> {
    let (_, token) = get_git_token(&state.settings, repo_url)?;
    let feature_branch = format!("iib-request-{}-{}", request_id, branch);

    info!("Creating feature branch {}", feature_branch);
    run_cmd(
        state.runner(),
        &git(local_repo_path).args(["checkout", "-b", feature_branch.as_str()]),
        Some("Error creating feature branch"),
    )
    .await?;
    commit_and_push(
        state,
        request_id,
        local_repo_path,
        repo_url,
        &feature_branch,
        commit_message,
    )
    .await?;

    state
        .merge_requests
        .create_merge_request(repo_url, &token, &feature_branch, branch, request_id)
        .await
}

pub async fn close_mr(state: &WorkerState, mr: &MergeRequest) -> Result<()> {
    let (_, token) = get_git_token(&state.settings, &mr.repo_url)?;
    state.merge_requests.close_merge_request(mr, &token).await
}

/// Drop the last commit of `branch` with a fresh clone and a force push
pub async fn revert_last_commit(
    state: &WorkerState,
    request_id: u64,
    repo_url: &str,
    branch: &str,
) -> Result<()> {
    let (token_name, token) = get_git_token(&state.settings, repo_url)?;
    let local_repo = tempfile::Builder::new()
        .prefix(&format!("git-repo-{}-", request_id))
        .tempdir()?;
    info!("Cloning repo to {}", local_repo.path().display());
    clone_git_repo(state, repo_url, branch, &token_name, &token, local_repo.path()).await?;
    configure_git_user(state, local_repo.path()).await?;

    info!("Reverting last commit to {} branch of {}", branch, repo_url);
    run_cmd(
        state.runner(),
        &git(local_repo.path()).args(["reset", "--hard", "HEAD~1"]),
        Some("Error resetting last commit"),
    )
    .await?;
    run_cmd(
        state.runner(),
        &git(local_repo.path()).args(["push", "--force", "origin", branch]),
        Some(&format!("Error pushing changes to git repo {}", repo_url)),
    )
    .await?;
    Ok(())
}
