use directories::ProjectDirs;
use std::path::PathBuf;

/// Daemon directories following the XDG layout
#[derive(Debug, Clone)]
pub struct Directories {
    /// Config directory (~/.config/sbdots)
    pub config: PathBuf,

    /// Log directory (~/.cache/sbdots/logs)
    pub logs: PathBuf,

    /// Daemon config file (~/.config/sbdots/actionsd.json)
    pub config_file: PathBuf,
}

impl Directories {
    /// Standard XDG paths, or paths under the temp directory when no home
    /// directory can be determined.
    #[must_use]
    pub fn new() -> Self {
        match ProjectDirs::from("", "", "sbdots") {
            Some(project) => {
                let config = project.config_dir().to_path_buf();
                Self {
                    logs: project.cache_dir().join("logs"),
                    config_file: config.join("actionsd.json"),
                    config,
                }
            }
            None => Self::with_base(std::env::temp_dir().join("sbdots")),
        }
    }

    #[must_use]
    pub fn with_base(base: PathBuf) -> Self {
        Self {
            logs: base.join("logs"),
            config_file: base.join("actionsd.json"),
            config: base,
        }
    }
}

impl Default for Directories {
    fn default() -> Self {
        Self::new()
    }
}
