//! Shared HTTP request helpers for CLI commands.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

/// Build `{base}{path}?k=v...`, skipping empty values.
pub fn url_with_params(port: u16, path: &str, params: &[(&str, String)]) -> Result<String> {
    let base = format!("{}{}", base_url(port), path);
    let params = params.iter().filter(|(_, v)| !v.is_empty());
    Ok(reqwest::Url::parse_with_params(&base, params)?.to_string())
}

/// Error statuses carry a plain-text reason; surface it.
async fn decode<R: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<R> {
    let status = resp.status();
    if !status.is_success() {
        let reason = resp.text().await.unwrap_or_default();
        bail!("veild returned {}: {}", status, reason);
    }
    resp.json::<R>().await.context("failed to parse response")
}

fn unreachable(url: &str) -> String {
    format!("failed to connect to veild at {}. Is it running?", url)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url).await.with_context(|| unreachable(url))?;
    decode(resp).await
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| unreachable(url))?;
    decode(resp).await
}

pub async fn post_json_body<T, R>(url: &str, body: &T) -> Result<R>
where
    T: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let resp = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| unreachable(url))?;
    decode(resp).await
}

pub async fn post_multipart<R: for<'de> Deserialize<'de>>(
    url: &str,
    form: reqwest::multipart::Form,
) -> Result<R> {
    let resp = reqwest::Client::new()
        .post(url)
        .multipart(form)
        .send()
        .await
        .with_context(|| unreachable(url))?;
    decode(resp).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_encoded_and_empty_ones_dropped() {
        let url = url_with_params(
            7421,
            "/communities",
            &[("q", "folk music".to_string()), ("tags", String::new())],
        )
        .unwrap();
        assert_eq!(url, "http://127.0.0.1:7421/api/communities?q=folk+music");
    }
}
