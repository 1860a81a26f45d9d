//! REST API payloads: the response envelope and query strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::build::BuildStatus;
use crate::store::{BuildFilter, Page, Pagination, DEFAULT_PAGE_LIMIT};

/// `{success, data | message}` envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationJson>,
}

impl<T> ApiResponse<T> {
    pub fn data(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            pagination: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
            pagination: None,
        }
    }
}

impl<T> From<Page<T>> for ApiResponse<Vec<T>> {
    fn from(page: Page<T>) -> Self {
        let pagination = PaginationJson {
            total: page.total,
            limit: page.limit,
            offset: page.offset,
            pages: page.pages(),
        };
        Self {
            success: true,
            data: Some(page.items),
            message: None,
            pagination: Some(pagination),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaginationJson {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub pages: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListBuildsQuery {
    pub project_id: Option<Uuid>,
    pub status: Option<BuildStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListBuildsQuery {
    pub fn filter(&self) -> BuildFilter {
        BuildFilter {
            project_id: self.project_id,
            status: self.status,
        }
    }

    pub fn pagination(&self) -> Pagination {
        Pagination {
            limit: self.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub message: &'static str,
    pub version: &'static str,
    pub status: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthJson {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime_secs: u64,
    pub active_builds: usize,
}
