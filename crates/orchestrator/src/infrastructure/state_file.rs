//! JSON state file backing the host registry

use std::fs;
use std::io;
use std::io::Write;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use crate::domain::registry::RegistrySnapshot;
use crate::domain::traits::PersistenceError;
use crate::domain::traits::SnapshotStore;

/// Stores registry snapshots in a single JSON file.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for JsonStateFile {
    fn load(&self) -> Result<Option<RegistrySnapshot>, Report<PersistenceError>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file yet");
                return Ok(None);
            }
            Err(err) => {
                return Err(Report::new(err).change_context(PersistenceError::ReadFailed {
                    path: self.display_path(),
                }))
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }

        let snapshot = serde_json::from_str(&content).change_context(PersistenceError::Corrupt {
            path: self.display_path(),
        })?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), Report<PersistenceError>> {
        let write_failed = || PersistenceError::WriteFailed {
            path: self.display_path(),
        };

        let data = serde_json::to_vec_pretty(snapshot).change_context_lazy(write_failed)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .change_context_lazy(write_failed)
                .attach_printable_lazy(|| format!("creating directory {}", parent.display()))?;
        }

        let temp_path = self.temp_path();
        let written = fs::File::create(&temp_path).and_then(|mut file| {
            file.write_all(&data)?;
            file.sync_all()
        });
        if let Err(err) = written.and_then(|()| fs::rename(&temp_path, &self.path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(Report::new(err)
                .change_context(write_failed())
                .attach_printable(format!("temporary file {}", temp_path.display())));
        }

        debug!(
            path = %self.path.display(),
            hosts = snapshot.hosts.len(),
            vms = snapshot.vms.len(),
            "state file written"
        );
        Ok(())
    }
}
