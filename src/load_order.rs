//! Load orders: which plugins to read, in which order.
//!
//! The text form follows the game's `plugins.txt`: one plugin per line,
//! `#` starts a comment, and a leading `*` marks the plugin active.  A list
//! without any `*` is taken as all-active.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::error::PluginError;
use crate::plugin::Plugin;

#[derive(Error, Debug)]
pub enum LoadOrderError {
    #[error("Plugin {plugin} not found in {}", folder.display())]
    NotFound { plugin: String, folder: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    LoadOrder(#[from] LoadOrderError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOrder {
    plugins: Vec<String>,
}

impl LoadOrder {
    pub fn new(plugins: Vec<String>) -> Self {
        Self { plugins }
    }

    /// Parses `plugins.txt` text, keeping active entries in file order.
    pub fn parse(text: &str) -> Self {
        let entries: Vec<(bool, &str)> = text.lines()
            .map(|l| l.split('#').next().unwrap_or("").trim())
            .filter(|l| !l.is_empty())
            .map(|l| match l.strip_prefix('*') {
                Some(name) => (true, name.trim()),
                None => (false, l),
            })
            .collect();
        let marked = entries.iter().any(|(active, _)| *active);
        let plugins = entries.into_iter()
            .filter(|(active, _)| *active || !marked)
            .map(|(_, name)| name.to_owned())
            .collect();
        Self { plugins }
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, LoadOrderError> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn plugins(&self) -> &[String] { &self.plugins }
    pub fn len(&self) -> usize { self.plugins.len() }
    pub fn is_empty(&self) -> bool { self.plugins.is_empty() }

    pub fn position(&self, plugin: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.eq_ignore_ascii_case(plugin))
    }

    /// The same order with `plugin` appended when it is not listed yet.
    pub fn with(&self, plugin: &str) -> Self {
        let mut plugins = self.plugins.clone();
        if self.position(plugin).is_none() {
            plugins.push(plugin.to_owned());
        }
        Self { plugins }
    }

    /// Path of every plugin inside `folder`.  File names match case-
    /// insensitively, as they do on the game's own file system.
    pub fn resolve<P: AsRef<Path>>(&self, folder: P) -> Result<Vec<PathBuf>, LoadOrderError> {
        let folder = folder.as_ref();
        let mut present = Vec::new();
        for entry in fs::read_dir(folder)? {
            present.push(entry?.file_name().to_string_lossy().into_owned());
        }
        self.plugins.iter().map(|plugin| {
            present.iter()
                .find(|f| f.eq_ignore_ascii_case(plugin))
                .map(|f| folder.join(f))
                .ok_or_else(|| LoadOrderError::NotFound { plugin: plugin.clone(), folder: folder.to_path_buf() })
        }).collect()
    }
}

/// Reads and parses every plugin of `order` from `folder`, in order.
pub fn load_plugins<P: AsRef<Path>>(order: &LoadOrder, folder: P) -> Result<Vec<Plugin>, LoadError> {
    let paths = order.resolve(folder)?;
    let mut plugins = Vec::with_capacity(paths.len());
    for (name, path) in order.plugins().iter().zip(paths) {
        let bytes = fs::read(&path).map_err(LoadOrderError::from)?;
        debug!(plugin = %name, path = %path.display(), bytes = bytes.len(), "loading plugin");
        plugins.push(Plugin::parse(name, &bytes)?);
    }
    Ok(plugins)
}
