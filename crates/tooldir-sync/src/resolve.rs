//! Replaces Product Hunt `/r/` redirect links stored on tools with their final URL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tooldir_storage::{SinkError, ToolCatalog};
use tracing::{info, warn};

pub const DEFAULT_RESOLVE_LIMIT: usize = 10;

/// Follows redirects for a URL and reports where it ends up.
#[async_trait]
pub trait FinalUrlProbe: Send + Sync {
    async fn final_url(&self, url: &str) -> Option<String>;
}

/// HEAD request with redirects followed.
#[derive(Debug, Clone)]
pub struct HeadProbe {
    client: reqwest::Client,
}

impl HeadProbe {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(user_agent)
            .build()
            .context("building redirect probe client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FinalUrlProbe for HeadProbe {
    async fn final_url(&self, url: &str) -> Option<String> {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                Some(resp.url().to_string())
            }
            Ok(resp) => {
                warn!(url, status = resp.status().as_u16(), "redirect probe got error status");
                None
            }
            Err(err) => {
                warn!(url, error = %err, "redirect probe failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub checked: usize,
    pub resolved: usize,
    pub cleared: usize,
}

pub struct UrlResolver {
    probe: Arc<dyn FinalUrlProbe>,
    limit: usize,
    pause: Duration,
}

impl UrlResolver {
    pub fn new(probe: Arc<dyn FinalUrlProbe>) -> Self {
        Self {
            probe,
            limit: DEFAULT_RESOLVE_LIMIT,
            pause: Duration::from_secs(2),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// A probe that fails, or lands back on producthunt.com, clears the stored URL.
    pub async fn run(&self, catalog: &dyn ToolCatalog) -> Result<ResolveReport, SinkError> {
        let candidates = catalog.redirect_candidates(self.limit).await?;
        let mut report = ResolveReport::default();
        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            report.checked += 1;
            let resolved = self
                .probe
                .final_url(&candidate.website_url)
                .await
                .filter(|url| !url.contains("producthunt.com"));
            catalog
                .set_website_url(&candidate.ph_id, resolved.as_deref())
                .await?;
            match resolved {
                Some(url) => {
                    info!(ph_id = %candidate.ph_id, %url, "resolved redirect url");
                    report.resolved += 1;
                }
                None => report.cleared += 1,
            }
        }
        Ok(report)
    }
}
