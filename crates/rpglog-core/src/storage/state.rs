//! Agent state persisted across restarts.
//!
//! Stored as a small JSON document: the resume marker of every tailed file
//! and the prefix format each server resolved to.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collector::log_collector::parser::PrefixFormat;
use crate::collector::log_collector::tailer::FileMarker;

/// Persisted state of one server.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct ServerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_format: Option<PrefixFormat>,
    /// Resume markers keyed by file path.
    #[serde(default)]
    pub files: BTreeMap<String, FileMarker>,
}

impl ServerState {
    /// Takes over the format and markers of `newer`, keeping markers of
    /// files `newer` does not mention.
    pub fn merge(&mut self, newer: ServerState) {
        if newer.prefix_format.is_some() {
            self.prefix_format = newer.prefix_format;
        }
        self.files.extend(newer.files);
    }

    pub fn set_marker(&mut self, file: &Path, marker: FileMarker) {
        self.files
            .insert(file.to_string_lossy().into_owned(), marker);
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct AgentState {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerState>,
}

impl AgentState {
    /// Loads state from `path`. A missing file yields empty state; an
    /// unreadable one is logged and ignored.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt state file");
                    Self::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read state file");
                Self::default()
            }
        }
    }

    /// Writes state atomically via a `.tmp` file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(tmp_path, path)
    }

    pub fn server(&self, name: &str) -> Option<&ServerState> {
        self.servers.get(name)
    }

    pub fn server_mut(&mut self, name: &str) -> &mut ServerState {
        self.servers.entry(name.to_string()).or_default()
    }

    pub fn marker(&self, server: &str, file: &Path) -> Option<FileMarker> {
        self.server(server)?
            .files
            .get(file.to_string_lossy().as_ref())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = AgentState::default();
        state.server_mut("primary").prefix_format = Some(PrefixFormat::TimePidVxidLineApp);
        state.server_mut("primary").set_marker(
            Path::new("/var/log/pg.log"),
            FileMarker {
                inode: 42,
                offset: 1024,
            },
        );
        state.save(&path).unwrap();

        let loaded = AgentState::load(&path);
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.marker("primary", Path::new("/var/log/pg.log")),
            Some(FileMarker {
                inode: 42,
                offset: 1024
            })
        );
        assert_eq!(loaded.marker("replica", Path::new("/var/log/pg.log")), None);

        let json = fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"time-pid-vxid-line-app\""));
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(AgentState::load(&path), AgentState::default());

        fs::write(&path, b"{not json").unwrap();
        assert_eq!(AgentState::load(&path), AgentState::default());
    }

    #[test]
    fn test_merge_keeps_unmentioned_files() {
        let old_marker = FileMarker {
            inode: 1,
            offset: 10,
        };
        let new_marker = FileMarker {
            inode: 2,
            offset: 20,
        };
        let mut state = ServerState {
            prefix_format: Some(PrefixFormat::TimeClientUserDbPid),
            ..Default::default()
        };
        state.files.insert("/a.log".into(), old_marker);
        state.files.insert("/b.log".into(), old_marker);

        let mut newer = ServerState::default();
        newer.files.insert("/b.log".into(), new_marker);
        state.merge(newer);

        assert_eq!(state.prefix_format, Some(PrefixFormat::TimeClientUserDbPid));
        assert_eq!(state.files["/a.log"], old_marker);
        assert_eq!(state.files["/b.log"], new_marker);
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/state.json");
        AgentState::default().save(&path).unwrap();
        assert!(path.exists());
    }
}
