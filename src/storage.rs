use crate::processor::{DataSink, DataSource};
use crate::srv_conn::SessionError;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};

/// Access to the files under the directory the server exposes.
///
/// Sessions open their files through here concurrently; nothing is locked, and two uploads to
/// the same name race on `create_new`, which lets exactly one of them win.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    allow_writes: bool,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, allow_writes: bool) -> Storage {
        Storage { root: root.into(), allow_writes }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a requested path onto the served directory. A leading slash is ignored, and paths
    /// that would climb out of the directory are refused.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SessionError> {
        let mut resolved = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(SessionError::AccessDenied(format!(
                        "Path '{path}' is outside the served directory"
                    )))
                }
            }
        }

        if resolved == self.root {
            return Err(SessionError::AccessDenied(format!("Path '{path}' does not name a file")));
        }
        Ok(resolved)
    }

    /// Symlinks are followed, but only while they lead somewhere under the served directory.
    async fn confine(
        &self,
        path: &str,
        real_path: &Path,
        io_error: fn(io::Error) -> SessionError,
    ) -> Result<(), SessionError> {
        let root = fs::canonicalize(&self.root).await.map_err(io_error)?;
        if !real_path.starts_with(&root) {
            log::warn!("'{path}' leads to {:#?}, outside {:#?}", real_path, root);
            return Err(SessionError::AccessDenied(format!(
                "Path '{path}' is outside the served directory"
            )));
        }
        Ok(())
    }

    /// Opens a file to be served, along with its size.
    pub async fn open_source(&self, path: &str) -> Result<(DataSource, Option<u64>), SessionError> {
        let full_path = self.resolve(path)?;
        let real_path = fs::canonicalize(&full_path).await.map_err(SessionError::SourceUnavailable)?;
        self.confine(path, &real_path, SessionError::SourceUnavailable).await?;
        log::info!("Reading from {:#?}", real_path);
        let file = File::open(&real_path).await.map_err(SessionError::SourceUnavailable)?;
        let metadata = file.metadata().await.map_err(SessionError::SourceUnavailable)?;
        if !metadata.is_file() {
            return Err(SessionError::AccessDenied(format!("'{path}' is not a regular file")));
        }
        Ok((Box::new(file), Some(metadata.len())))
    }

    /// Creates the file an upload is written to. Existing files are never overwritten.
    pub async fn create_sink(&self, path: &str) -> Result<DataSink, SessionError> {
        if !self.allow_writes {
            return Err(SessionError::AccessDenied("Server does not accept writes".to_string()));
        }
        let full_path = self.resolve(path)?;
        let (Some(parent), Some(name)) = (full_path.parent(), full_path.file_name()) else {
            return Err(SessionError::AccessDenied(format!("Path '{path}' does not name a file")));
        };
        let real_parent = fs::canonicalize(parent).await.map_err(SessionError::SinkFailure)?;
        self.confine(path, &real_parent, SessionError::SinkFailure).await?;

        // create_new also refuses to follow a symlink in the last component.
        let real_path = real_parent.join(name);
        log::info!("Writing to {:#?}", real_path);
        let file = File::create_new(&real_path).await.map_err(SessionError::SinkFailure)?;
        Ok(Box::new(file))
    }

    /// Removes the partial file left behind by an upload that did not complete.
    pub async fn discard(&self, path: &str) {
        let Ok(full_path) = self.resolve(path) else {
            return;
        };
        match fs::remove_file(&full_path).await {
            Ok(()) => log::info!("Removed incomplete upload {:#?}", full_path),
            Err(e) => log::warn!("Couldn't remove incomplete upload {:#?}: {e}", full_path),
        }
    }
}
