//! Load generator that races many voters against one counter.

use anyhow::{Context, Result};
use futures::future::join_all;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cli::SimulateArgs;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub counted: usize,
    pub contention: usize,
    pub failed: usize,
    /// Highest `new_count` any voter was told about.
    pub highest_count: Option<u64>,
}

impl SimulationReport {
    fn record(&mut self, status: StatusCode, body: &Value) {
        match status {
            StatusCode::OK => {
                self.counted += 1;
                let count = body.get("new_count").and_then(Value::as_u64);
                self.highest_count = self.highest_count.max(count);
            }
            StatusCode::CONFLICT => self.contention += 1,
            _ => self.failed += 1,
        }
    }
}

/// Sends `args.voters` votes at once and prints every response body as it lands.
///
/// A voter that cannot reach the server or gets an unreadable answer counts as
/// failed; only a panicked voter task aborts the run.
pub async fn run(args: SimulateArgs) -> Result<SimulationReport> {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/sessions/{}/vote",
        args.server.trim_end_matches('/'),
        args.session
    );

    let voters = (0..args.voters).map(|voter| {
        let client = client.clone();
        let url = url.clone();
        let option = args.option.clone();
        tokio::spawn(async move {
            let response = client
                .post(&url)
                .json(&json!({ "option_id": option }))
                .send()
                .await
                .with_context(|| format!("voter {voter} could not reach {url}"))?;
            let status = response.status();
            let body: Value = response
                .json()
                .await
                .with_context(|| format!("voter {voter} got a non-json response"))?;
            debug!(voter, %status, "vote answered");
            println!("{body}");
            anyhow::Ok((status, body))
        })
    });

    let mut report = SimulationReport::default();
    for outcome in join_all(voters).await {
        match outcome.context("voter task panicked")? {
            Ok((status, body)) => report.record(status, &body),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "vote failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}
