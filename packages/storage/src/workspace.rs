//! Per-job directories on the local disk.
//!
//! ```text
//! <root>/<job_id>/
//!   input/bundle.zip   original upload, read-only after ingest
//!   work/              scratch mounted read-write into the sandbox
//!   output/            derived models, written atomically
//! ```

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use scan_core::JobId;

use crate::StorageError;
use crate::object::env_bool;

pub const BUNDLE_FILE: &str = "bundle.zip";
pub const METADATA_FILE: &str = "metadata.json";
pub const IMAGES_DIR: &str = "images";

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    /// Keep the scratch directory after a job reaches a terminal state.
    pub retain_scratch: bool,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retain_scratch: false,
        }
    }

    /// `WORKSPACE_ROOT` (default `./data/workspace`) and `RETAIN_SCRATCH`.
    pub fn from_env() -> Result<Self, StorageError> {
        let root = std::env::var("WORKSPACE_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/workspace"));
        Ok(Self {
            root,
            retain_scratch: env_bool("RETAIN_SCRATCH")?.unwrap_or(false),
        })
    }
}

/// What a bundle holds, read without extracting it.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSummary {
    pub image_count: usize,
    /// Raw `metadata.json`, when the archive carries one.
    pub metadata: Option<Vec<u8>>,
}

/// Check that `bundle` is a readable zip and summarise it.
pub fn inspect_bundle(bundle: &[u8]) -> Result<BundleSummary, StorageError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bundle))?;
    let mut image_count = 0;
    let mut metadata = None;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = flat_name(entry.name()) else {
            continue;
        };
        if is_image(&name) {
            image_count += 1;
        } else if name.eq_ignore_ascii_case(METADATA_FILE) && metadata.is_none() {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            metadata = Some(buf);
        }
    }
    Ok(BundleSummary {
        image_count,
        metadata,
    })
}

/// Last path component of an archive entry, if it is a plain file name.
fn flat_name(entry_name: &str) -> Option<String> {
    let name = entry_name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." || name.starts_with("._") {
        return None;
    }
    Some(name.to_string())
}

fn is_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Unpack image entries of `bundle` into `dest`, flattening directories.
/// Returns the number of images written.
fn extract_images(bundle: &[u8], dest: &Path) -> Result<usize, StorageError> {
    std::fs::create_dir_all(dest)?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bundle))?;
    let mut taken = HashSet::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || entry.enclosed_name().is_none() {
            continue;
        }
        let Some(name) = flat_name(entry.name()).filter(|n| is_image(n)) else {
            continue;
        };
        let name = unique_name(&mut taken, name);
        let mut out = std::fs::File::create(dest.join(&name))?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(taken.len())
}

fn unique_name(taken: &mut HashSet<String>, name: String) -> String {
    if taken.insert(name.to_ascii_lowercase()) {
        return name;
    }
    let path = Path::new(&name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("jpg");
    let mut n = 1;
    loop {
        let candidate = format!("{stem}_{n}.{ext}");
        if taken.insert(candidate.to_ascii_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

/// Factory for job directories under one root.
#[derive(Debug, Clone)]
pub struct Workspaces {
    config: WorkspaceConfig,
}

impl Workspaces {
    /// Create the root if needed. The stored root is absolute so job
    /// directories can be bind-mounted.
    pub async fn new(config: WorkspaceConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.root).await?;
        let root = tokio::fs::canonicalize(&config.root).await?;
        Ok(Self {
            config: WorkspaceConfig { root, ..config },
        })
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn job(&self, id: JobId) -> JobWorkspace {
        JobWorkspace {
            id,
            dir: self.config.root.join(id.to_string()),
        }
    }

    /// Lay out a new job directory and store its bundle.
    pub async fn ingest(&self, id: JobId, bundle: Bytes) -> Result<JobWorkspace, StorageError> {
        let ws = self.job(id);
        tokio::fs::create_dir_all(ws.input_dir()).await?;
        tokio::fs::create_dir_all(ws.scratch_dir()).await?;
        tokio::fs::create_dir_all(ws.output_dir()).await?;
        write_atomic(&ws.bundle_path(), &bundle).await?;
        tracing::debug!(job_id = %id, bytes = bundle.len(), "bundle stored");
        Ok(ws)
    }

    /// Remove everything stored for a job that was never recorded.
    pub async fn discard(&self, id: JobId) -> Result<(), StorageError> {
        remove_dir_if_exists(self.job(id).dir()).await
    }

    /// Drop the scratch directory of a finished job unless configured to keep it.
    pub async fn finish(&self, ws: &JobWorkspace) -> Result<(), StorageError> {
        if self.config.retain_scratch {
            return Ok(());
        }
        remove_dir_if_exists(&ws.scratch_dir()).await
    }
}

/// One job's directory.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    id: JobId,
    dir: PathBuf,
}

impl JobWorkspace {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_dir(&self) -> PathBuf {
        self.dir.join("input")
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.input_dir().join(BUNDLE_FILE)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.join("work")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.join("output")
    }

    pub async fn read_bundle(&self) -> Result<Bytes, StorageError> {
        Ok(Bytes::from(tokio::fs::read(self.bundle_path()).await?))
    }

    /// Extract the bundle's images into `work/images`.
    pub async fn extract_images(&self) -> Result<usize, StorageError> {
        let bundle = self.read_bundle().await?;
        let dest = self.scratch_dir().join(IMAGES_DIR);
        let count = tokio::task::spawn_blocking(move || extract_images(&bundle, &dest)).await??;
        if count == 0 {
            return Err(StorageError::InvalidBundle(
                "bundle contains no .jpg, .jpeg or .png images".into(),
            ));
        }
        Ok(count)
    }

    /// Wipe the scratch directory and recreate it empty.
    pub async fn reset_scratch(&self) -> Result<(), StorageError> {
        let scratch = self.scratch_dir();
        remove_dir_if_exists(&scratch).await?;
        tokio::fs::create_dir_all(&scratch).await?;
        Ok(())
    }

    /// Resolve a scratch-relative path, refusing anything that leaves scratch.
    pub fn scratch_path(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        Ok(self.scratch_dir().join(rel))
    }

    pub async fn scratch_exists(&self, relative: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.scratch_path(relative)?).await?)
    }

    pub async fn create_scratch_dir(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let path = self.scratch_path(relative)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Remove a scratch-relative file or directory. Missing paths are fine.
    pub async fn remove_scratch(&self, relative: &str) -> Result<(), StorageError> {
        let path = self.scratch_path(relative)?;
        if path == self.scratch_dir() {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => remove_dir_if_exists(&path).await,
            Ok(_) => Ok(tokio::fs::remove_file(&path).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// First numbered model directory under `work/sparse`, as a
    /// scratch-relative path such as `sparse/0`.
    pub async fn find_model_dir(&self) -> Result<Option<String>, StorageError> {
        let sparse = self.scratch_dir().join("sparse");
        let mut entries = match tokio::fs::read_dir(&sparse).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut best: Option<u32> = None;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                best = Some(best.map_or(n, |b| b.min(n)));
            }
        }
        Ok(best.map(|n| format!("sparse/{n}")))
    }

    /// Write a derived file into `output/` atomically.
    pub async fn write_output(&self, name: &str, contents: &[u8]) -> Result<PathBuf, StorageError> {
        if flat_name(name).as_deref() != Some(name) {
            return Err(StorageError::InvalidPath(name.to_string()));
        }
        tokio::fs::create_dir_all(self.output_dir()).await?;
        let path = self.output_dir().join(name);
        write_atomic(&path, contents).await?;
        Ok(path)
    }

    pub async fn read_output(&self, name: &str) -> Result<Bytes, StorageError> {
        if flat_name(name).as_deref() != Some(name) {
            return Err(StorageError::InvalidPath(name.to_string()));
        }
        Ok(Bytes::from(tokio::fs::read(self.output_dir().join(name)).await?))
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::InvalidPath(path.display().to_string()))?;
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&temp, contents).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
