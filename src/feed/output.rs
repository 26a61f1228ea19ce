use super::parser::{FeedDocument, FeedItem};
use crate::fetch::{ErrorKind, FetchError};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result envelope handed back to the caller.
///
/// Exactly one of `items` (success) or `error` (failure) is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_language: Option<String>,
    pub items: Vec<FeedItem>,
    pub total_items: usize,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl FeedOutput {
    pub fn success(document: FeedDocument) -> Self {
        Self {
            success: true,
            feed_title: document.title,
            feed_description: document.description,
            feed_link: document.link,
            feed_language: document.language,
            total_items: document.items.len(),
            items: document.items,
            fetched_at: Utc::now(),
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            feed_title: None,
            feed_description: None,
            feed_link: None,
            feed_language: None,
            items: Vec::new(),
            total_items: 0,
            fetched_at: Utc::now(),
            error: Some(error.into()),
            error_kind: None,
        }
    }
}

impl From<Result<FeedDocument, FetchError>> for FeedOutput {
    fn from(result: Result<FeedDocument, FetchError>) -> Self {
        match result {
            Ok(document) => Self::success(document),
            Err(e) => Self {
                error_kind: Some(e.kind()),
                ..Self::failure(e.to_string())
            },
        }
    }
}
