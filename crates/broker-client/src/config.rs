use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

/// Optional on-disk defaults for the demo CLI, so a token doesn't have to
/// be typed on every invocation. Entirely optional: every field here can
/// also be passed as a CLI flag, which always wins.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub server: Option<String>,
    pub token: Option<String>,
}

impl FileConfig {
    /// Loads `~/.broker-client.yaml` if it exists; returns defaults otherwise.
    /// A malformed file is a hard error, since a silently-ignored typo in a
    /// token would be confusing to debug.
    pub fn load() -> anyhow::Result<Self> {
        let Some(path) = config_path() else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .map_err(|err| anyhow::anyhow!("failed to read {}: {err}", path.display()))?;
        serde_yaml::from_str(&raw)
            .map_err(|err| anyhow::anyhow!("failed to parse {}: {err}", path.display()))
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".broker-client.yaml"))
}
