//! Page walking for listing endpoints.
//!
//! Listings come back either as a bare JSON array (complete in one call) or
//! as an object holding the page items under `results`, `items`, `subjects`
//! or `data`, optionally with an integer `totalCount`.

use std::collections::HashSet;

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::entity::EntitySummary;
use crate::error::{preview, PaginationError};
use crate::transport::{ApiRequest, Transport};

/// The API's own default page size, used as the fallback.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_MAX_PAGES: u32 = 10_000;

const LIST_KEYS: [&str; 4] = ["results", "items", "subjects", "data"];
const SHAPE_PREVIEW_LIMIT: usize = 300;

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: u32,
    pub items: Vec<EntitySummary>,
    pub total_count: Option<u64>,
    /// The response was a bare array, so the listing is complete.
    pub bare: bool,
}

/// Why a walk stopped after a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BareArray,
    TotalReached,
    ShortPage,
}

/// Interpret one listing payload.
pub fn parse_page(number: u32, payload: Value) -> Result<Page, PaginationError> {
    match payload {
        Value::Array(items) => Ok(Page {
            number,
            items: items.into_iter().map(EntitySummary::from_value).collect(),
            total_count: None,
            bare: true,
        }),
        Value::Object(mut map) => {
            let items = LIST_KEYS
                .iter()
                .find_map(|key| match map.remove(*key) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| PaginationError::UnexpectedShape {
                    page: number,
                    preview: preview(&Value::Object(map.clone()).to_string(), SHAPE_PREVIEW_LIMIT),
                })?;
            let total_count = map.get("totalCount").and_then(Value::as_u64);
            Ok(Page {
                number,
                items: items.into_iter().map(EntitySummary::from_value).collect(),
                total_count,
                bare: false,
            })
        }
        other => Err(PaginationError::UnexpectedShape {
            page: number,
            preview: preview(&other.to_string(), SHAPE_PREVIEW_LIMIT),
        }),
    }
}

/// Termination check, applied in order. A short page always stops the walk,
/// even when `totalCount` claims more items.
pub fn stop_reason(page: &Page, cumulative: u64, page_size: u32) -> Option<StopReason> {
    if page.bare {
        return Some(StopReason::BareArray);
    }
    if let Some(total) = page.total_count {
        if cumulative >= total {
            return Some(StopReason::TotalReached);
        }
    }
    if page.items.is_empty() || (page.items.len() as u64) < u64::from(page_size) {
        return Some(StopReason::ShortPage);
    }
    None
}

struct Walk<'a> {
    transport: &'a dyn Transport,
    path: String,
    query: Vec<(String, String)>,
    page_size: u32,
    max_pages: u32,
    next_page: u32,
    seen: u64,
    done: bool,
}

impl Walk<'_> {
    async fn fetch(&self, number: u32) -> Result<Page, PaginationError> {
        let mut request = ApiRequest::get(self.path.clone());
        for (k, v) in &self.query {
            request = request.with_query(k.clone(), v);
        }
        let request = request
            .with_query("pageNumber", number)
            .with_query("pageSize", self.page_size);

        let payload = self
            .transport
            .send(request)
            .await
            .and_then(|resp| resp.json())
            .map_err(|source| PaginationError::Page {
                page: number,
                source,
            })?;
        parse_page(number, payload)
    }
}

/// Walks a listing endpoint page by page.
#[derive(Clone)]
pub struct Paginator<'a> {
    transport: &'a dyn Transport,
    page_size: u32,
    max_pages: u32,
    query: Vec<(String, String)>,
}

impl<'a> Paginator<'a> {
    pub fn new(transport: &'a dyn Transport, page_size: u32) -> Self {
        Self {
            transport,
            page_size: page_size.max(1),
            max_pages: DEFAULT_MAX_PAGES,
            query: Vec::new(),
        }
    }

    pub fn from_config(transport: &'a dyn Transport, config: &RunConfig) -> Self {
        Self::new(transport, config.page_size).with_max_pages(config.max_pages)
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Fixed query parameter sent with every page request.
    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Lazy page stream. Ends after the last page or the first error.
    pub fn pages(&self, path: &str) -> impl Stream<Item = Result<Page, PaginationError>> + 'a {
        self.walk(path, self.page_size)
    }

    fn walk(&self, path: &str, page_size: u32) -> impl Stream<Item = Result<Page, PaginationError>> + 'a {
        let state = Walk {
            transport: self.transport,
            path: path.to_string(),
            query: self.query.clone(),
            page_size,
            max_pages: self.max_pages,
            next_page: 1,
            seen: 0,
            done: false,
        };

        stream::unfold(state, |mut walk| async move {
            if walk.done {
                return None;
            }
            if walk.next_page > walk.max_pages {
                walk.done = true;
                let err = PaginationError::PageLimitExceeded {
                    path: walk.path.clone(),
                    max_pages: walk.max_pages,
                };
                return Some((Err(err), walk));
            }

            let number = walk.next_page;
            match walk.fetch(number).await {
                Ok(page) => {
                    walk.seen += page.items.len() as u64;
                    walk.next_page += 1;
                    let stop = stop_reason(&page, walk.seen, walk.page_size);
                    debug!(
                        path = %walk.path,
                        page = number,
                        items = page.items.len(),
                        total_count = ?page.total_count,
                        cumulative = walk.seen,
                        stop = ?stop,
                        "page fetched"
                    );
                    walk.done = stop.is_some();
                    Some((Ok(page), walk))
                }
                Err(err) => {
                    walk.done = true;
                    Some((Err(err), walk))
                }
            }
        })
    }

    /// Drain the listing into a de-duplicated list, first occurrence wins.
    /// Summaries without an id are kept in place.
    pub async fn collect(&self, path: &str) -> Result<Vec<EntitySummary>, PaginationError> {
        match self.collect_with(path, self.page_size).await {
            Err(err) if self.page_size > DEFAULT_PAGE_SIZE && err.is_first_page_server_error() => {
                warn!(
                    path = %path,
                    page_size = self.page_size,
                    fallback = DEFAULT_PAGE_SIZE,
                    error = %err,
                    "first page failed with HTTP 500; retrying listing with default page size"
                );
                self.collect_with(path, DEFAULT_PAGE_SIZE).await
            }
            other => other,
        }
    }

    async fn collect_with(
        &self,
        path: &str,
        page_size: u32,
    ) -> Result<Vec<EntitySummary>, PaginationError> {
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        let mut duplicates = 0usize;

        let pages = self.walk(path, page_size);
        futures::pin_mut!(pages);
        while let Some(page) = pages.next().await {
            for summary in page?.items {
                match &summary.id {
                    Some(id) if !seen_ids.insert(id.clone()) => duplicates += 1,
                    _ => out.push(summary),
                }
            }
        }

        info!(path = %path, count = out.len(), duplicates, "listing collected");
        Ok(out)
    }
}
