//! Ordered class names used for debug counts and preview labels.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassFile {
    names: Vec<String>,
}

/// Class names indexed by detector class id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassList {
    names: Vec<String>,
}

impl ClassList {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Load `names = [...]` from a TOML file, or one name per line from a
    /// plain text file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read class list {}", path.display()))?;
        let list = Self::parse(&text)
            .with_context(|| format!("invalid class list {}", path.display()))?;
        if list.is_empty() {
            bail!("class list {} declares no classes", path.display());
        }
        Ok(list)
    }

    fn parse(text: &str) -> Result<Self> {
        if text.contains('=') {
            let file: ClassFile = toml::from_str(text)?;
            return Ok(Self::new(file.names));
        }
        Ok(Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from)
                .collect(),
        ))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    /// Display name, `class_<id>` for ids the list does not cover.
    pub fn label(&self, class_id: usize) -> String {
        self.get(class_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}
