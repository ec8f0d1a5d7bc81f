use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use super::AppConfig;
use crate::Result;

/// Parse configuration text.
pub fn parse_config(text: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(text)?;
    config.timezone()?;
    Ok(config)
}

/// Read the file at `path`. A missing file yields the defaults.
///
/// Also returns the raw text so a watcher can tell when it changes.
pub async fn load_config(path: &Path) -> Result<(AppConfig, Option<String>)> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let config = parse_config(&text)?;
            Ok((config, Some(text)))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "Config file not found; using defaults");
            Ok((AppConfig::default(), None))
        }
        Err(e) => Err(e.into()),
    }
}
