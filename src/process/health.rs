//! HTTP probes against the browser control endpoint and the app health path.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// Entry of the `/json/list` response.
#[derive(Debug, Deserialize)]
pub(super) struct DevtoolsTarget {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
}

/// Probe `/json/version` on the control port.
pub(super) async fn browser_ready(client: &Client, port: u16, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{}/json/version", port);

    match client.get(&url).timeout(timeout).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Open pages of the browser. An unreachable endpoint yields an empty list.
pub(super) async fn list_pages(
    client: &Client,
    port: u16,
    timeout: Duration,
) -> Vec<DevtoolsTarget> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    let resp = match client.get(&url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            log::debug!("GET {} returned {}", url, resp.status());
            return Vec::new();
        }
        Err(e) => {
            log::debug!("GET {} failed: {}", url, e);
            return Vec::new();
        }
    };

    match resp.json::<Vec<DevtoolsTarget>>().await {
        Ok(targets) => targets.into_iter().filter(|t| t.kind == "page").collect(),
        Err(e) => {
            log::warn!("Unexpected /json/list payload on port {}: {}", port, e);
            Vec::new()
        }
    }
}

/// Close one page. Newer browsers only accept PUT on this endpoint.
pub(super) async fn close_page(
    client: &Client,
    port: u16,
    target_id: &str,
    timeout: Duration,
) -> bool {
    let url = format!("http://127.0.0.1:{}/json/close/{}", port, target_id);

    match client.get(&url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => client
            .put(&url)
            .timeout(timeout)
            .send()
            .await
            .is_ok_and(|resp| resp.status().is_success()),
        _ => false,
    }
}

/// Probe the app health path.
pub(super) async fn app_healthy(client: &Client, port: u16, path: &str, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{}{}", port, path);

    match client.get(&url).timeout(timeout).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
