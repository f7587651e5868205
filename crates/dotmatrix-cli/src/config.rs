use std::path::{Path, PathBuf};

use dotmatrix_core::HardwareMode;
use log::warn;
use serde::{Deserialize, Serialize};

/// Settings read from `cli.toml`. Command-line flags win over every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CliConfig {
    pub mode: HardwareMode,
    /// Frames to run when neither `--frames` nor `--cycles` is given.
    pub frames: u64,
    pub sample_rate: u32,
    /// Directory for battery saves. Next to the ROM when unset.
    pub save_dir: Option<PathBuf>,
    pub serial_stdout: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            mode: HardwareMode::Auto,
            frames: 60,
            sample_rate: 44_100,
            save_dir: None,
            serial_stdout: false,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("dotmatrix").join("cli.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("dotmatrix")
            .join("cli.toml");
    }

    PathBuf::from("cli.toml")
}

/// A missing file gives the defaults; a malformed one is reported and
/// ignored.
pub fn load_from_file(path: &Path) -> CliConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return CliConfig::default(),
    };

    match toml::from_str::<CliConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse config {}: {e}; using defaults",
                path.display()
            );
            CliConfig::default()
        }
    }
}
