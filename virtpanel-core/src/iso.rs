//! ISO library: the installation images in the ISO directory.
//!
//! The directory itself is the record; listing reads it every time, so
//! images copied in by hand show up too. An image cannot be deleted while a
//! VM's CD-ROM holds it. Inserting an image takes the image's entity lock as
//! well, so the reference check and the removal cannot interleave with it.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::VmCatalog;
use crate::command::{validate_iso_file_name, UploadIso};
use crate::config::CoreConfig;
use crate::error::{CoreError, EntityKind, Result};
use crate::locks::{EntityKey, EntityLocks};
use crate::model::IsoImage;

/// Lock key of the image at `path`, equal for equal paths however spelled.
pub(crate) fn iso_key(path: &Path) -> EntityKey {
    let normalized: PathBuf = path.components().collect();
    EntityKey::Iso(normalized.to_string_lossy().into_owned())
}

fn io_error(path: &Path, source: io::Error) -> CoreError {
    CoreError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

async fn write_file<R: AsyncRead + Unpin>(path: &Path, reader: &mut R) -> io::Result<u64> {
    let mut file = fs::File::create(path).await?;
    let bytes = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(bytes)
}

pub struct IsoLibrary {
    iso_dir: PathBuf,
    catalog: Arc<VmCatalog>,
    locks: Arc<EntityLocks>,
}

impl IsoLibrary {
    pub fn new(config: Arc<CoreConfig>, catalog: Arc<VmCatalog>, locks: Arc<EntityLocks>) -> Self {
        Self {
            iso_dir: config.iso_dir.clone(),
            catalog,
            locks,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.iso_dir
    }

    /// Every `.iso` file directly inside the ISO directory, by name. A
    /// missing directory holds no images.
    pub async fn list(&self) -> Result<Vec<IsoImage>> {
        let mut entries = match fs::read_dir(&self.iso_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %self.iso_dir.display(), "ISO directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_error(&self.iso_dir, e)),
        };

        let mut images = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.iso_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_iso_file_name(&name).is_err() {
                continue;
            }
            match fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_file() => {
                    images.push(self.image(name, &metadata).await);
                }
                Ok(_) => {}
                Err(e) => debug!(file = %name, error = %e, "Skipping unreadable ISO"),
            }
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    pub async fn get(&self, name: &str) -> Result<IsoImage> {
        let name = validate_iso_file_name(name)?;
        let path = self.iso_dir.join(&name);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(self.image(name, &metadata).await),
            Ok(_) => Err(CoreError::not_found(EntityKind::Iso, name)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CoreError::not_found(EntityKind::Iso, name))
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Store an image read from `reader`. The file only appears under its
    /// name once it is complete; an existing image is never overwritten.
    #[instrument(skip(self, cmd, reader, cancel), fields(iso = %cmd.file_name))]
    pub async fn upload<R>(&self, cmd: UploadIso, mut reader: R, cancel: &CancellationToken) -> Result<IsoImage>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.iso_dir.join(&cmd.file_name);
        let _guard = self.locks.lock(iso_key(&path)).await;

        match fs::metadata(&path).await {
            Ok(_) => {
                return Err(CoreError::conflict(
                    EntityKind::Iso,
                    &cmd.file_name,
                    "upload",
                    "an image with this name already exists",
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path, e)),
        }
        fs::create_dir_all(&self.iso_dir)
            .await
            .map_err(|e| io_error(&self.iso_dir, e))?;

        let partial = self.iso_dir.join(format!(".{}.part", cmd.file_name));
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(CoreError::cancelled(EntityKind::Iso, &cmd.file_name, "upload"))
            }
            copied = write_file(&partial, &mut reader) => copied.map_err(|e| io_error(&path, e)),
        };
        let stored = match written {
            Ok(bytes) => fs::rename(&partial, &path)
                .await
                .map(|_| bytes)
                .map_err(|e| io_error(&path, e)),
            Err(e) => Err(e),
        };

        match stored {
            Ok(bytes) => info!(bytes, "ISO uploaded"),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(file = %partial.display(), error = %cleanup, "Failed to remove partial upload");
                    }
                }
                return Err(e);
            }
        }
        self.get(&cmd.file_name).await
    }

    /// Remove an image. Fails with `Conflict` while any VM's CD-ROM holds it.
    #[instrument(skip(self), fields(iso = %name))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let name = validate_iso_file_name(name)?;
        let path = self.iso_dir.join(&name);
        let key = iso_key(&path);
        let guard = self.locks.lock(key.clone()).await;

        self.get(&name).await?;
        let users = self.catalog.iso_references(&path).await;
        if !users.is_empty() {
            return Err(CoreError::conflict(
                EntityKind::Iso,
                &name,
                "delete",
                format!("inserted in vm '{}'", users.join("', '")),
            ));
        }

        fs::remove_file(&path).await.map_err(|e| io_error(&path, e))?;
        drop(guard);
        self.locks.forget(&key);
        info!("ISO deleted");
        Ok(())
    }

    async fn image(&self, name: String, metadata: &std::fs::Metadata) -> IsoImage {
        let path = self.iso_dir.join(&name);
        IsoImage {
            used_by: self.catalog.iso_references(&path).await,
            path: path.to_string_lossy().into_owned(),
            size_bytes: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            name,
        }
    }
}
