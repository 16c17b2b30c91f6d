//! Retry loop around a single page fetch, shrinking the request on rate-limit signals.

use std::time::Duration;

use serde::Serialize;
use tooldir_adapters::{FetchedPage, ListingSource, PageRequest, SourceError};
use tooldir_core::{FieldSelection, MIN_PAGE_SIZE};
use tooldir_storage::BackoffPolicy;

use crate::SyncObserver;

/// How a retry changed the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Degradation {
    /// Transient failure; the same request is retried.
    Unchanged,
    DroppedEnrichment,
    ShrankPageSize { from: u32, to: u32 },
    /// Nothing left to shed; only the delay grows.
    AtFloor,
}

/// Shed cost: enrichment first, then halve the page size down to the floor.
pub fn degrade(request: &mut PageRequest) -> Degradation {
    if request.selection.is_enriched() {
        request.selection = FieldSelection::Minimal;
        return Degradation::DroppedEnrichment;
    }
    if request.page_size > MIN_PAGE_SIZE {
        let from = request.page_size;
        request.page_size = (from / 2).max(MIN_PAGE_SIZE);
        return Degradation::ShrankPageSize {
            from,
            to: request.page_size,
        };
    }
    Degradation::AtFloor
}

#[derive(Debug)]
pub struct RetryEvent<'a> {
    pub page: u32,
    /// 1-based retry number.
    pub retry: usize,
    pub error: &'a SourceError,
    pub degradation: Degradation,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub error: SourceError,
    /// Total fetches made, including the first.
    pub attempts: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffController {
    policy: BackoffPolicy,
}

impl BackoffController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Fetch one page, retrying at most `max_retries` times.
    ///
    /// `request` is degraded in place and keeps its reduced settings after return,
    /// whether the fetch eventually succeeded or not.
    pub async fn fetch_page(
        &self,
        source: &dyn ListingSource,
        request: &mut PageRequest,
        page: u32,
        observer: &dyn SyncObserver,
    ) -> Result<FetchedPage, FetchFailure> {
        let mut retries = 0usize;
        loop {
            let error = match source.fetch_page(request).await {
                Ok(fetched) => return Ok(fetched),
                Err(error) => error,
            };
            if !error.is_retryable() || retries >= self.policy.max_retries {
                return Err(FetchFailure {
                    error,
                    attempts: retries + 1,
                });
            }

            let degradation = if error.wants_degradation() {
                degrade(request)
            } else {
                Degradation::Unchanged
            };
            let delay = self.policy.delay_for_attempt(retries);
            retries += 1;
            observer.on_retry(&RetryEvent {
                page,
                retry: retries,
                error: &error,
                degradation,
                delay,
            });
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
