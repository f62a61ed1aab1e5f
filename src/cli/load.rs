//! Synthetic load against a running ingestor.
//!
//! Fires `count` submissions at `POST /api/metrics` with at most
//! `concurrency` requests in flight, then reports how many the service
//! accepted, how many it shed, and how many never got an answer.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::web::api::SubmitMetricResponse;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid load parameters: {0}")]
    InvalidArgs(String),
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub url: String,
    pub count: usize,
    pub concurrency: usize,
    pub source_name: Option<String>,
    pub metric_name: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Serialize)]
struct LoadMetric<'a> {
    source_name: &'a str,
    metric_name: &'a str,
    value: i64,
    timestamp: String,
}

enum Outcome {
    Accepted,
    Rejected,
    Failed,
}

/// Default source name for generated metrics: this machine's hostname.
pub fn default_source_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "load-generator".to_string())
}

pub async fn run(opts: LoadOptions) -> Result<LoadReport, LoadError> {
    if opts.concurrency == 0 {
        return Err(LoadError::InvalidArgs(
            "concurrency must be at least 1".to_string(),
        ));
    }
    if opts.metric_name.trim().is_empty() {
        return Err(LoadError::InvalidArgs(
            "metric_name cannot be empty".to_string(),
        ));
    }

    let source_name = opts
        .source_name
        .clone()
        .unwrap_or_else(default_source_name);
    let endpoint = format!("{}/api/metrics", opts.url.trim_end_matches('/'));
    let client = reqwest::Client::builder().build()?;

    info!(
        endpoint = %endpoint,
        count = opts.count,
        concurrency = opts.concurrency,
        source_name = %source_name,
        "Starting load run"
    );

    let outcomes: Vec<Outcome> = stream::iter(0..opts.count)
        .map(|i| {
            let client = &client;
            let endpoint = &endpoint;
            let source_name = &source_name;
            let metric_name = &opts.metric_name;
            async move {
                let metric = LoadMetric {
                    source_name,
                    metric_name,
                    value: (i % 100) as i64,
                    timestamp: Utc::now().to_rfc3339(),
                };
                submit(client, endpoint, &metric).await
            }
        })
        .buffer_unordered(opts.concurrency)
        .collect()
        .await;

    let mut report = LoadReport::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Accepted => report.accepted += 1,
            Outcome::Rejected => report.rejected += 1,
            Outcome::Failed => report.failed += 1,
        }
    }

    info!(
        accepted = report.accepted,
        rejected = report.rejected,
        failed = report.failed,
        "Load run complete"
    );
    Ok(report)
}

async fn submit(client: &reqwest::Client, endpoint: &str, metric: &LoadMetric<'_>) -> Outcome {
    let response = match client.post(endpoint).json(metric).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Request failed");
            return Outcome::Failed;
        }
    };

    if !response.status().is_success() {
        debug!(status = %response.status(), "Non-success response");
        return Outcome::Failed;
    }

    match response.json::<SubmitMetricResponse>().await {
        Ok(body) if body.accepted => Outcome::Accepted,
        Ok(_) => Outcome::Rejected,
        Err(e) => {
            warn!(error = %e, "Unreadable response body");
            Outcome::Failed
        }
    }
}
