use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// how file objects are laid out on disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoMode {
    /// object inode carries real ownership, mode and xattrs
    #[default]
    Bare,
    /// object inode carries permission bits only; ownership and xattrs in a sidecar
    BareUser,
    /// header plus zstd-compressed content in a single file
    #[serde(alias = "archive-z2")]
    Archive,
}

impl FromStr for RepoMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bare" => Ok(RepoMode::Bare),
            "bare-user" => Ok(RepoMode::BareUser),
            "archive" | "archive-z2" => Ok(RepoMode::Archive),
            _ => Err(Error::InvalidRepoMode(s.to_string())),
        }
    }
}

impl fmt::Display for RepoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepoMode::Bare => "bare",
            RepoMode::BareUser => "bare-user",
            RepoMode::Archive => "archive",
        })
    }
}

/// `[core]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub mode: RepoMode,
    /// write a tombstone whenever a commit object is deleted
    #[serde(default)]
    pub tombstone_commits: bool,
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

fn default_fsync() -> bool {
    true
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mode: RepoMode::default(),
            tombstone_commits: false,
            fsync: true,
        }
    }
}

/// repository configuration stored in config.toml
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub core: CoreConfig,
    /// configured remotes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remotes: Vec<Remote>,
}

impl Config {
    pub fn new(mode: RepoMode) -> Self {
        Self {
            core: CoreConfig {
                mode,
                ..Default::default()
            },
            remotes: vec![],
        }
    }

    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// add a remote
    pub fn add_remote(&mut self, name: impl Into<String>, url: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.remotes.iter().any(|r| r.name == name) {
            return Err(Error::RemoteExists(name));
        }
        self.remotes.push(Remote {
            name,
            url: url.into(),
        });
        Ok(())
    }

    /// remove a remote
    pub fn remove_remote(&mut self, name: &str) -> Result<()> {
        let pos = self
            .remotes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::RemoteNotFound(name.to_string()))?;
        self.remotes.remove(pos);
        Ok(())
    }

    /// get remote by name
    pub fn get_remote(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.name == name)
    }
}

/// a configured remote repository
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub url: String,
}

impl Remote {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}
