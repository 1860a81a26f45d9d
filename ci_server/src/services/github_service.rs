//! GitHub integration: webhook signature validation and push payloads.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::models::build::{TriggerRequest, TriggerSource};
use crate::models::project::ProjectId;

type HmacSha256 = Hmac<Sha256>;

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// The parts of a `push` event a build needs.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    pub repository: PushRepository,
    pub head_commit: Option<HeadCommit>,
    pub pusher: Option<Pusher>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    #[serde(default)]
    pub full_name: String,
    pub html_url: Option<String>,
    pub clone_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pusher {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl PushEvent {
    /// Branch name for `refs/heads/*` pushes; tags and other refs yield `None`.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref
            .strip_prefix("refs/heads/")
            .filter(|b| !b.is_empty())
    }

    /// URLs a registered project may use for this repository.
    pub fn repository_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = [&self.repository.html_url, &self.repository.clone_url]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        if !self.repository.full_name.is_empty() {
            urls.push(format!("https://github.com/{}", self.repository.full_name));
        }
        urls
    }

    pub fn into_trigger(self, project_id: ProjectId) -> TriggerRequest {
        let branch = self.branch().map(str::to_string);
        // GitHub sends forty zeros for branch deletions.
        let commit = Some(self.after)
            .filter(|sha| !sha.is_empty() && sha.chars().any(|c| c != '0'))
            .map(|sha| sha.chars().take(7).collect());
        let (author, author_email) = self
            .pusher
            .map(|p| (p.name, p.email))
            .unwrap_or_default();
        TriggerRequest {
            project_id,
            branch,
            commit,
            commit_message: self.head_commit.and_then(|c| c.message),
            author,
            author_email,
            triggered_by: Some(TriggerSource::Webhook),
        }
    }
}
