//! CLI command implementations

use crate::output::{format_bytes, print_output};
use crate::progress::TransferProgress;
use crate::OutputFormat;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use resumable_core::{
    Downloader, HeaderMap, HeaderName, HeaderValue, ProgressRecord, ProgressStore, SqliteStore,
    TransferError, TransferSettings, TransferState,
};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;

/// Arguments of `resumable get`
pub struct GetRequest {
    pub url: String,
    pub output: Option<PathBuf>,
    pub headers: Vec<String>,
    pub fresh: bool,
}

/// Read settings from a JSON file, falling back to defaults
pub async fn load_settings(path: Option<&Path>) -> Result<TransferSettings> {
    let Some(path) = path else {
        return Ok(TransferSettings::default());
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Parse `Name: value` pairs into a header map
pub fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for entry in raw {
        let (name, value) = entry
            .split_once(':')
            .ok_or_else(|| anyhow!("header '{}' is not in 'Name: value' form", entry))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid header name in '{}'", entry))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid header value in '{}'", entry))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// File name to use when `-o` is not given
fn default_output(url: &str) -> PathBuf {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("download"))
}

// ============================================================================
// Transfer Commands
// ============================================================================

#[derive(Serialize)]
struct GetReport {
    url: String,
    path: PathBuf,
    bytes: u64,
}

impl fmt::Display for GetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Saved {} to {}",
            style("✓").green().bold(),
            format_bytes(self.bytes),
            style(self.path.display()).cyan()
        )
    }
}

pub async fn get(
    db_path: &Path,
    request: GetRequest,
    settings: TransferSettings,
    format: OutputFormat,
) -> Result<()> {
    let headers = parse_headers(&request.headers)?;
    let destination = request
        .output
        .unwrap_or_else(|| default_output(&request.url));

    let store = SqliteStore::open(db_path, &request.url).await?;
    if request.fresh {
        store.clear().await?;
    }

    let progress = match format {
        OutputFormat::Human => TransferProgress::new(&store.record().await?),
        OutputFormat::Json => TransferProgress::hidden(),
    };

    let downloader = Downloader::with_settings(settings)?;
    let mut events = downloader.subscribe();

    let cancel = downloader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = {
        let run = downloader.run(&request.url, &headers, &store);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => break result,
                event = events.recv() => match event {
                    Ok(event) => progress.handle_event(&event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {}
                },
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        progress.handle_event(&event);
    }

    let payload = match result {
        Ok(payload) => payload,
        Err(TransferError::Cancelled) => {
            progress.abandon(format!(
                "{} Cancelled, run the same command again to resume",
                style("○").dim()
            ));
            return Err(anyhow!("transfer of {} cancelled", request.url));
        }
        Err(e) => return Err(e.into()),
    };

    tokio::fs::write(&destination, &payload)
        .await
        .with_context(|| format!("writing {}", destination.display()))?;
    store.forget().await?;

    print_output(
        &GetReport {
            url: request.url,
            path: destination,
            bytes: payload.len() as u64,
        },
        format,
    )
}

#[derive(Serialize)]
struct StatusReport {
    url: String,
    state: TransferState,
    #[serde(flatten)]
    record: ProgressRecord,
    stored_bytes: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", style(&self.url).cyan())?;
        writeln!(f, "  State:    {}", self.state)?;
        match self.record.total_size {
            Some(total) => writeln!(
                f,
                "  Progress: {} / {} ({:.1}%)",
                format_bytes(self.record.received_bytes()),
                format_bytes(total),
                self.record.progress()
            )?,
            None => writeln!(f, "  Progress: {}", format_bytes(self.stored_bytes))?,
        }
        if let Some(tag) = &self.record.identity {
            writeln!(f, "  ETag:     {}", tag)?;
        }
        if let Some(range) = &self.record.last_range {
            writeln!(f, "  Last:     bytes {}", range)?;
        }
        if let Some(updated) = &self.updated_at {
            write!(f, "  Updated:  {}", updated.to_rfc3339())?;
        }
        Ok(())
    }
}

pub async fn status(db_path: &Path, url: &str, format: OutputFormat) -> Result<()> {
    let Some(store) = SqliteStore::find(db_path, url).await? else {
        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "url": url, "state": null }));
            }
            OutputFormat::Human => {
                println!("{} No stored progress for {}", style("○").dim(), url);
            }
        }
        return Ok(());
    };

    let report = StatusReport {
        url: url.to_string(),
        state: store.state().await?,
        record: store.record().await?,
        stored_bytes: store.received_bytes().await?,
        updated_at: store.updated_at().await?,
    };

    print_output(&report, format)
}

pub async fn forget(db_path: &Path, url: &str, format: OutputFormat) -> Result<()> {
    let store = SqliteStore::open(db_path, url).await?;
    store.forget().await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "url": url, "forgotten": true }));
        }
        OutputFormat::Human => {
            println!("{} Forgot stored progress for {}", style("✓").green().bold(), url);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&[
            "Authorization: Bearer abc".to_string(),
            "X-Trace:1".to_string(),
        ])
        .unwrap();

        assert_eq!(headers.get("authorization").unwrap().to_str().unwrap(), "Bearer abc");
        assert_eq!(headers.get("x-trace").unwrap().to_str().unwrap(), "1");
        assert!(parse_headers(&["no-colon".to_string()]).is_err());
    }

    #[test]
    fn test_default_output_name() {
        assert_eq!(
            default_output("https://example.com/files/data.csv"),
            PathBuf::from("data.csv")
        );
        assert_eq!(default_output("https://example.com/"), PathBuf::from("download"));
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        assert_eq!(load_settings(None).await.unwrap(), TransferSettings::default());
    }
}
