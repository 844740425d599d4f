//! Preset video library: named groups of looping feeds.
//!
//! A group maps a client-facing stream name to the set of local video files
//! that come up together when the group is loaded. Groups are discovered
//! from a directory layout of `<group>/<feed>.mp4`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One looping feed inside a preset group.
#[derive(Debug, Clone)]
pub struct PresetFeed {
    pub file: PathBuf,
    pub feed_name: String,
}

/// Named groups of preset feeds.
#[derive(Debug, Default)]
pub struct PresetLibrary {
    groups: HashMap<String, Vec<PresetFeed>>,
}

impl PresetLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovers groups from `dir`: each subdirectory is a group, and each
    /// `.mp4` inside becomes a feed named after its file stem. Feeds are
    /// ordered by file name so group loads are deterministic.
    pub fn from_dir(dir: &Path) -> std::io::Result<Self> {
        let mut groups = HashMap::new();

        for group_entry in std::fs::read_dir(dir)? {
            let group_entry = group_entry?;
            if !group_entry.file_type()?.is_dir() {
                continue;
            }
            let group_name = group_entry.file_name().to_string_lossy().into_owned();

            let mut feeds = Vec::new();
            for feed_entry in std::fs::read_dir(group_entry.path())? {
                let path = feed_entry?.path();
                if path.extension().is_some_and(|ext| ext == "mp4")
                    && let Some(stem) = path.file_stem()
                {
                    feeds.push(PresetFeed {
                        feed_name: stem.to_string_lossy().into_owned(),
                        file: path,
                    });
                }
            }
            feeds.sort_by(|a, b| a.file.cmp(&b.file));

            if !feeds.is_empty() {
                groups.insert(group_name, feeds);
            }
        }

        Ok(Self { groups })
    }

    pub fn insert_group(&mut self, name: String, feeds: Vec<PresetFeed>) {
        self.groups.insert(name, feeds);
    }

    pub fn group(&self, name: &str) -> Option<&[PresetFeed]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
