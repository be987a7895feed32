//! Publishing combined rasters to a blob container and invalidating the map
//! server's cached layers.
//!
//! The store exposes two prefixes: `current/` holds exactly one blob per
//! forecast day plus the perimeter and is overwritten on every publish;
//! `archive/` keeps one blob per unique output name forever, so an archive
//! blob that already exists is left alone.

use crate::run::RunMetadata;
use anyhow::{anyhow, Context, Result};
use firestarr_sources::net::mask_url;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

const UPLOAD_RETRIES: u32 = 5;

pub struct BlobPublisher {
    client: reqwest::Client,
    base_url: String,
    container: String,
    token: Option<String>,
    geoserver_url: Option<String>,
    geoserver_credentials: Option<String>,
}

impl BlobPublisher {
    /// Build a publisher from settings, or `None` when no store is
    /// configured.
    pub fn from_settings(settings: &crate::config::Settings) -> Result<Option<BlobPublisher>> {
        let (Some(base_url), Some(container)) =
            (settings.azure_url.clone(), settings.azure_container.clone())
        else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to build upload client")?;
        Ok(Some(BlobPublisher {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            container,
            token: settings.azure_token.clone(),
            geoserver_url: settings.geoserver_url.clone(),
            geoserver_credentials: settings.geoserver_credentials.clone(),
        }))
    }

    /// Upload every file to `current/` (overwriting) and `archive/`
    /// (skipping blobs that already exist), then invalidate the map server.
    pub async fn publish(&self, files: &[PathBuf], meta: &RunMetadata) -> Result<()> {
        for file in files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("unnameable output: {}", file.display()))?;
            let body = tokio::fs::read(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            self.put_blob(&format!("current/{}", current_name(name)), &body, meta, name)
                .await?;
            let archive = format!("archive/{name}");
            if self.blob_exists(&archive).await? {
                debug!(blob = %archive, "archive blob already present");
            } else {
                self.put_blob(&archive, &body, meta, name).await?;
            }
        }
        info!(files = files.len(), "published outputs");
        self.invalidate_geoserver().await;
        Ok(())
    }

    async fn put_blob(
        &self,
        blob: &str,
        body: &[u8],
        meta: &RunMetadata,
        file_name: &str,
    ) -> Result<()> {
        let url = self.blob_url(blob);
        let mut last_err = None;
        for attempt in 1..=UPLOAD_RETRIES {
            let mut request = self
                .client
                .put(&url)
                .header("x-ms-blob-type", "BlockBlob")
                .header("x-ms-meta-run_id", &meta.run_id)
                .header("x-ms-meta-source", &meta.source)
                .header("x-ms-meta-run_length", meta.run_length.to_string())
                .header("x-ms-meta-origin_date", &meta.origin_date)
                .body(body.to_vec());
            if let Some(for_date) = for_date_of(file_name) {
                request = request.header("x-ms-meta-for_date", for_date);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(blob = %blob, bytes = body.len(), "uploaded");
                    return Ok(());
                }
                Ok(response) => {
                    last_err = Some(anyhow!(
                        "upload of {} returned {}",
                        mask_url(&url),
                        response.status()
                    ));
                }
                Err(e) => last_err = Some(anyhow!(e)),
            }
            warn!(blob = %blob, attempt, "upload failed, retrying");
            tokio::time::sleep(Duration::from_secs(u64::from(attempt) * 2)).await;
        }
        Err(last_err.unwrap_or_else(|| anyhow!("upload of {blob} failed")))
    }

    async fn blob_exists(&self, blob: &str) -> Result<bool> {
        let url = self.blob_url(blob);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", mask_url(&url)))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(anyhow!("HEAD {} returned {}", mask_url(&url), status)),
        }
    }

    fn blob_url(&self, blob: &str) -> String {
        let mut url = format!("{}/{}/{}", self.base_url, self.container, blob);
        if let Some(token) = &self.token {
            url.push('?');
            url.push_str(token.trim_start_matches('?'));
        }
        url
    }

    /// Ask the map server to drop its cached tiles for the published layers.
    /// Failures are logged, not propagated: stale tiles fix themselves on
    /// the next publish.
    async fn invalidate_geoserver(&self) {
        let Some(url) = &self.geoserver_url else {
            return;
        };
        let mut request = self
            .client
            .post(format!("{}/rest/reset", url.trim_end_matches('/')));
        if let Some(credentials) = &self.geoserver_credentials {
            if let Some((user, pass)) = credentials.split_once(':') {
                request = request.basic_auth(user, Some(pass));
            }
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!("map server cache invalidated");
            }
            Ok(response) => warn!(status = %response.status(), "map server reset rejected"),
            Err(e) => warn!(error = %e, "map server reset failed"),
        }
    }
}

/// Blob name under `current/`: day outputs keep a stable name per day
/// offset so each publish replaces the previous run's blob for that day.
fn current_name(file_name: &str) -> String {
    if file_name.ends_with("_perim.tif") {
        return "firestarr_perim.tif".to_string();
    }
    match day_of(file_name) {
        Some(day) => format!("firestarr_day_{day:02}.tif"),
        None => file_name.to_string(),
    }
}

/// `firestarr_<run>_day_<NN>_<YYYYMMDD>.tif` → `NN`.
fn day_of(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".tif")?;
    let mut parts = stem.rsplit('_');
    let _date = parts.next()?;
    parts.next()?.parse().ok()
}

/// `firestarr_<run>_day_<NN>_<YYYYMMDD>.tif` → `YYYY-MM-DD`.
fn for_date_of(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".tif")?;
    let date = stem.rsplit('_').next()?;
    if date.len() == 8 && date.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("{}-{}-{}", &date[..4], &date[4..6], &date[6..8]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_names_stable_per_day() {
        assert_eq!(
            current_name("firestarr_m3_202406150210_day_01_20240616.tif"),
            "firestarr_day_01.tif"
        );
        assert_eq!(
            current_name("firestarr_m3_202406150210_day_14_20240629.tif"),
            "firestarr_day_14.tif"
        );
        assert_eq!(
            current_name("firestarr_m3_202406150210_perim.tif"),
            "firestarr_perim.tif"
        );
    }

    #[test]
    fn test_for_date_extraction() {
        assert_eq!(
            for_date_of("firestarr_m3_202406150210_day_01_20240616.tif").as_deref(),
            Some("2024-06-16")
        );
        assert_eq!(for_date_of("firestarr_m3_202406150210_perim.tif"), None);
        assert_eq!(for_date_of("notes.txt"), None);
    }

    #[test]
    fn test_blob_url_token_forms() {
        let publisher = BlobPublisher {
            client: reqwest::Client::new(),
            base_url: "https://store.example".to_string(),
            container: "fires".to_string(),
            token: Some("?sv=abc".to_string()),
            geoserver_url: None,
            geoserver_credentials: None,
        };
        assert_eq!(
            publisher.blob_url("current/firestarr_day_01.tif"),
            "https://store.example/fires/current/firestarr_day_01.tif?sv=abc"
        );
    }
}
