/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rand::{thread_rng, Rng};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Sends the request built by `build`, retrying transport errors and
/// 429/5xx responses. Other statuses are returned as-is.
pub async fn send_with_retry<F>(mut build: F, attempts: u32) -> Result<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let last = attempt >= max_attempts;
        match build().send().await {
            Ok(resp) => {
                if should_retry_status(resp.status()) && !last {
                    tracing::debug!(status = %resp.status(), attempt, "retrying http request");
                } else {
                    return Ok(resp);
                }
            }
            Err(e) => {
                if last {
                    return Err(e.into());
                }
                tracing::debug!(error = %e, attempt, "retrying http request");
            }
        }
        sleep_with_jitter(backoff).await;
        backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
    }
}

/// GET `url` and return the body as text; non-2xx is an error.
pub async fn get_text(client: &Client, url: &str, attempts: u32) -> Result<String> {
    let resp = send_with_retry(|| client.get(url), attempts)
        .await
        .with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("GET {url}: http {status}");
    }
    resp.text().await.with_context(|| format!("read body {url}"))
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}
