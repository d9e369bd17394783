use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::stats::RunStats;

use super::wire::{
    AbnormalMessage, AbnormalsMessage, MessageResponse, PsSnapshot, StatMessage, StatsMessage,
};
use super::StatsAggregator;

/// HTTP/JSON parameter server client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
}

impl Client {
    /// Create a new parameter server client.
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn log_request(&self, route: &str, status: &str, start: Instant) {
        debug!(
            route,
            status,
            elapsed_us = start.elapsed().as_micros() as u64,
            "parameter server request"
        );
    }

    /// POST `body` and return the raw response after checking the status.
    async fn post(&self, path: &str, body: Option<&(impl Serialize + Sync)>) -> Result<reqwest::Response> {
        let start = Instant::now();
        let route = route_from_path(path);
        let url = format!("{}{}", self.endpoint, path);

        let mut request = self.http.post(&url).header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.log_request(route, "error", start);
                return Err(e).with_context(|| format!("requesting {path}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.log_request(route, "error", start);
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        self.log_request(route, "success", start);

        Ok(response)
    }

    /// POST `body` and deserialize the JSON response.
    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&(impl Serialize + Sync)>,
    ) -> Result<T> {
        self.post(path, body)
            .await?
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))
    }

    /// Asks the server to stop; returns its text reply.
    pub async fn shutdown(&self) -> Result<String> {
        debug!("requesting parameter server shutdown");

        self.post(ROUTE_SHUTDOWN, None::<&()>)
            .await?
            .text()
            .await
            .context("reading shutdown reply")
    }
}

const ROUTE_SHUTDOWN: &str = "/shutdown";

/// Extract a short route name from an API path.
fn route_from_path(path: &str) -> &'static str {
    match path {
        "/update" => "update",
        "/update_all" => "update_all",
        "/stat" => "stat_all",
        "/add_abnormal" => "add_abnormal",
        "/add_abnormal_all" => "add_abnormal_all",
        "/clear" => "clear",
        "/dump" => "dump",
        ROUTE_SHUTDOWN => "shutdown",
        p if p.starts_with("/stat/") => "stat",
        _ => "other",
    }
}

impl StatsAggregator for Client {
    async fn update(&self, func_id: u64, partial: RunStats) -> Result<RunStats> {
        let req = StatMessage {
            id: func_id,
            stat: partial,
        };
        let resp: StatMessage = self
            .post_json("/update", Some(&req))
            .await
            .with_context(|| format!("updating function {func_id}"))?;
        Ok(resp.stat)
    }

    async fn update_all(&self, partials: HashMap<u64, RunStats>) -> Result<HashMap<u64, RunStats>> {
        debug!(functions = partials.len(), "pushing statistics");

        let req = StatsMessage { stats: partials };
        let resp: StatsMessage = self
            .post_json("/update_all", Some(&req))
            .await
            .context("updating statistics")?;
        Ok(resp.stats)
    }

    async fn get(&self, func_id: u64) -> Result<RunStats> {
        let resp: StatMessage = self
            .post_json(&format!("/stat/{func_id}"), None::<&()>)
            .await
            .with_context(|| format!("fetching function {func_id}"))?;
        Ok(resp.stat)
    }

    async fn get_all(&self) -> Result<HashMap<u64, RunStats>> {
        let resp: PsSnapshot = self
            .post_json("/stat", None::<&()>)
            .await
            .context("fetching statistics")?;
        Ok(resp.ps)
    }

    async fn add_abnormal(&self, func_id: u64, n: u64) -> Result<u64> {
        let req = AbnormalMessage {
            id: func_id,
            abnormal: n,
        };
        let resp: AbnormalMessage = self
            .post_json("/add_abnormal", Some(&req))
            .await
            .with_context(|| format!("adding abnormal count for function {func_id}"))?;
        Ok(resp.abnormal)
    }

    async fn add_abnormal_all(&self, counts: HashMap<u64, u64>) -> Result<HashMap<u64, u64>> {
        let req = AbnormalsMessage { abnormals: counts };
        let resp: AbnormalsMessage = self
            .post_json("/add_abnormal_all", Some(&req))
            .await
            .context("adding abnormal counts")?;
        Ok(resp.abnormals)
    }

    async fn clear(&self) -> Result<()> {
        let resp: MessageResponse = self
            .post_json("/clear", None::<&()>)
            .await
            .context("clearing parameter server")?;
        debug!(message = %resp.message, "parameter server cleared");
        Ok(())
    }
}
