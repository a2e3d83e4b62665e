//! Shell configuration, read from `lanroom.toml` in the working directory.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Name shown to other peers. Falls back to the hostname when unset.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Room to join on startup.
    #[serde(default)]
    pub default_room: Option<String>,
    /// Where completed file transfers are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            default_room: None,
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    /// Load `lanroom.toml` from the working directory. On first run a
    /// commented template is written and defaults are used.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::current_dir()?.join("lanroom.toml");
        if !path.exists() {
            let template = "# lanroom configuration\n\
                # display_name = \"alice\"\n\
                # default_room = \"lobby\"\n\
                # download_dir = \"downloads\"\n";
            fs::write(&path, template)?;
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }
}
