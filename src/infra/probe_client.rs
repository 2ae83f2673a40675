//! 页面探测 HTTP Client
//!
//! 请求应用首页，确认状态码与页面标记文本

use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::env::constants::PAGE_MARKER;

/// 探测结果
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub url: String,
    pub status: u16,
    pub marker_found: bool,
    pub elapsed_ms: u128,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        self.status == StatusCode::OK.as_u16() && self.marker_found
    }
}

/// 探测客户端
#[derive(Clone)]
pub struct ProbeClient {
    client: Client,
    marker: String,
}

impl ProbeClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            marker: PAGE_MARKER.to_string(),
        })
    }

    /// Look for a different marker text.
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    /// GET `url` once. Transport errors are returned as-is; no retry.
    pub async fn probe(&self, url: &str) -> Result<ProbeReport, reqwest::Error> {
        let started = Instant::now();
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let report = ProbeReport {
            url: url.to_string(),
            status: status.as_u16(),
            marker_found: body.contains(&self.marker),
            elapsed_ms: started.elapsed().as_millis(),
        };
        if report.is_healthy() {
            info!(url, status = report.status, elapsed_ms = report.elapsed_ms as u64, "Probe succeeded");
        } else {
            warn!(
                url,
                status = report.status,
                marker_found = report.marker_found,
                "Probe did not find the expected page"
            );
        }
        Ok(report)
    }
}
