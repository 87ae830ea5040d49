use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "LAZYHOST_DATA_DIR";

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            data_dir: base.join("lazyhost"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("lazyhost.pid")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.data_dir.join("lazyhost.sock")
    }

    /// Names of backends held forever, one per line.
    pub fn holds_file(&self) -> PathBuf {
        self.data_dir.join("holds.txt")
    }
}
