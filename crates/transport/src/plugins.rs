//! Read-only plugin listing endpoint, consumed by presentation only.

use reqwest::Client;
use shared::types::PluginInfo;
use std::sync::LazyLock;
use std::time::Duration;

static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

/// `GET {base}/api/plugins`.
pub async fn fetch_plugins(base: &str) -> Result<Vec<PluginInfo>, reqwest::Error> {
    let url = format!("{}/api/plugins", base);
    let resp = SHARED_HTTP.get(url).send().await?.error_for_status()?;
    resp.json().await
}
