// REST side of the notification store: history backfill plus best-effort
// read/dismiss sync. Trait-based so the store can be tested without HTTP.

use std::future::Future;

use dentika_common::types::{NotificationId, RawNotification, ReadFilter};
use serde::{Deserialize, Serialize};

use crate::api::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub page: u32,
    pub limit: u32,
    pub filter: ReadFilter,
}

impl PageQuery {
    pub fn first(limit: u32) -> Self {
        Self { page: 1, limit, filter: ReadFilter::All }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
}

/// `data` of `GET /notifications`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationPage {
    pub notifications: Vec<RawNotification>,
    pub pagination: Pagination,
}

pub trait NotificationBackfill: Send + Sync + 'static {
    fn fetch_page(&self, query: PageQuery) -> impl Future<Output = Result<NotificationPage, ApiError>> + Send;

    fn unread_count(&self) -> impl Future<Output = Result<u64, ApiError>> + Send;

    fn mark_read(&self, id: &NotificationId) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn mark_all_read(&self) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn dismiss(&self, id: &NotificationId) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Ask the server to push a test notification back over the bus.
    fn send_test(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Backfill for sessions without a REST server.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackfill;

impl NotificationBackfill for NoBackfill {
    async fn fetch_page(&self, query: PageQuery) -> Result<NotificationPage, ApiError> {
        Ok(NotificationPage {
            notifications: Vec::new(),
            pagination: Pagination { page: query.page, limit: query.limit, total: 0, total_pages: 0 },
        })
    }

    async fn unread_count(&self) -> Result<u64, ApiError> {
        Ok(0)
    }

    async fn mark_read(&self, _id: &NotificationId) -> Result<(), ApiError> {
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn dismiss(&self, _id: &NotificationId) -> Result<(), ApiError> {
        Ok(())
    }

    async fn send_test(&self) -> Result<(), ApiError> {
        Ok(())
    }
}
