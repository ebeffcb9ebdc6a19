//! Published artifacts in object storage.
//!
//! Backends:
//! - S3-compatible storage in production
//! - On-disk storage for single-host deployments
//! - In-memory storage for tests
//!
//! A put is atomic in every backend, so a reader sees either the previous
//! object or the complete new one.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::ObjectStoreExt;
use object_store::path::Path;
use scan_core::{ArtifactFormat, JobId, artifact_prefix};
use serde::{Deserialize, Serialize};

use crate::StorageError;

const DEFAULT_FS_ROOT: &str = "./data/artifacts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::S3 => "s3",
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub virtual_hosted_style: bool,
}

#[derive(Debug, Clone)]
pub enum StorageBackendConfig {
    S3(S3Config),
    Filesystem { root: PathBuf },
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendConfig,
    /// Optional key prefix applied to all object keys.
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackendConfig::Memory,
            prefix: None,
        }
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackendConfig::Filesystem { root: root.into() },
            prefix: None,
        }
    }

    /// Build a config from environment variables.
    ///
    /// - `STORAGE_BACKEND`: `s3`, `filesystem` (default) or `memory`
    /// - `STORAGE_FS_ROOT`: filesystem root (default `./data/artifacts`)
    /// - `STORAGE_PREFIX`: key prefix shared by every object
    /// - `S3_BUCKET` (required for s3), `AWS_REGION` (default `us-east-1`),
    ///   `S3_ENDPOINT`, `S3_ALLOW_HTTP`, `S3_VIRTUAL_HOSTED_STYLE`,
    ///   `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
    pub fn from_env() -> Result<Self, StorageError> {
        let backend = match env_opt("STORAGE_BACKEND").as_deref() {
            Some("s3") => StorageBackendConfig::S3(s3_from_env()?),
            Some("memory") | Some("mem") => StorageBackendConfig::Memory,
            Some("filesystem") | Some("fs") | None => StorageBackendConfig::Filesystem {
                root: env_opt("STORAGE_FS_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FS_ROOT)),
            },
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unsupported STORAGE_BACKEND={other} (expected s3|filesystem|memory)"
                )));
            }
        };

        Ok(Self {
            backend,
            prefix: env_opt("STORAGE_PREFIX"),
        })
    }
}

/// Index written next to a job's artifacts once all of them are in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub job_id: JobId,
    pub formats: Vec<ArtifactFormat>,
    pub sizes: Vec<u64>,
}

#[derive(Clone)]
pub struct Storage {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl Storage {
    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, store) = match cfg.backend {
            StorageBackendConfig::S3(s3) => (StorageKind::S3, Arc::new(build_s3(s3)?) as _),
            StorageBackendConfig::Filesystem { root } => {
                tokio::fs::create_dir_all(&root).await?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Arc::new(fs) as _)
            }
            StorageBackendConfig::Memory => {
                let mem = object_store::memory::InMemory::new();
                (StorageKind::Memory, Arc::new(mem) as _)
            }
        };

        Ok(Self {
            kind,
            store,
            prefix: cfg
                .prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        })
    }

    pub async fn from_env() -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env()?).await
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    fn to_path(&self, key: &str) -> Result<Path, StorageError> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(StorageError::InvalidConfig(
                "object key must not be empty".to_string(),
            ));
        }
        Ok(match self.prefix.as_deref() {
            Some(prefix) => Path::from(format!("{prefix}/{key}")),
            None => Path::from(key),
        })
    }

    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.to_path(key)?;
        self.store
            .put(&path, object_store::PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.to_path(key)?;
        let res = self.store.get(&path).await?;
        Ok(res.bytes().await?)
    }

    /// Like [`Storage::get_bytes`], with a missing object mapped to `None`.
    pub async fn try_get_bytes(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        match self.get_bytes(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::ObjectStore(object_store::Error::NotFound { .. })) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Publish every artifact of a job, then its manifest. Returns the
    /// artifact path to record on the job.
    pub async fn publish_artifacts(
        &self,
        job_id: JobId,
        artifacts: Vec<(ArtifactFormat, Bytes)>,
    ) -> Result<String, StorageError> {
        let mut manifest = ArtifactManifest {
            job_id,
            formats: Vec::with_capacity(artifacts.len()),
            sizes: Vec::with_capacity(artifacts.len()),
        };
        for (format, bytes) in artifacts {
            manifest.formats.push(format);
            manifest.sizes.push(bytes.len() as u64);
            self.put_bytes(&format.object_key(job_id), bytes).await?;
        }

        let prefix = artifact_prefix(job_id);
        let body = serde_json::to_vec(&manifest)?;
        self.put_bytes(&format!("{prefix}/manifest.json"), Bytes::from(body))
            .await?;

        tracing::info!(%job_id, formats = manifest.formats.len(), "artifacts published");
        Ok(prefix)
    }

    pub async fn fetch_artifact(
        &self,
        job_id: JobId,
        format: ArtifactFormat,
    ) -> Result<Option<Bytes>, StorageError> {
        self.try_get_bytes(&format.object_key(job_id)).await
    }

    pub async fn manifest(&self, job_id: JobId) -> Result<Option<ArtifactManifest>, StorageError> {
        let key = format!("{}/manifest.json", artifact_prefix(job_id));
        match self.try_get_bytes(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_bool(name: &str) -> Result<Option<bool>, StorageError> {
    let Some(raw) = env_opt(name) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(Some(true)),
        "0" | "false" | "no" | "n" => Ok(Some(false)),
        _ => Err(StorageError::InvalidConfig(format!(
            "invalid boolean for {name}={raw} (expected true/false)"
        ))),
    }
}

fn s3_from_env() -> Result<S3Config, StorageError> {
    let bucket = env_opt("S3_BUCKET").ok_or_else(|| {
        StorageError::InvalidConfig("S3_BUCKET is required for s3 backend".into())
    })?;
    let endpoint = env_opt("S3_ENDPOINT");
    let allow_http = env_bool("S3_ALLOW_HTTP")?.unwrap_or_else(|| {
        endpoint
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().starts_with("http://"))
    });

    Ok(S3Config {
        bucket,
        region: env_opt("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        endpoint,
        allow_http,
        access_key_id: env_opt("AWS_ACCESS_KEY_ID"),
        secret_access_key: env_opt("AWS_SECRET_ACCESS_KEY"),
        virtual_hosted_style: env_bool("S3_VIRTUAL_HOSTED_STYLE")?.unwrap_or(false),
    })
}

fn build_s3(cfg: S3Config) -> Result<object_store::aws::AmazonS3, StorageError> {
    let mut builder = object_store::aws::AmazonS3Builder::new()
        .with_bucket_name(cfg.bucket)
        .with_region(cfg.region)
        .with_virtual_hosted_style_request(cfg.virtual_hosted_style)
        .with_allow_http(cfg.allow_http);

    if let Some(endpoint) = cfg.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if let Some(access_key_id) = cfg.access_key_id {
        builder = builder.with_access_key_id(access_key_id);
    }
    if let Some(secret_access_key) = cfg.secret_access_key {
        builder = builder.with_secret_access_key(secret_access_key);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[tokio::test]
    async fn publishes_and_fetches_artifacts() -> Result<(), StorageError> {
        let storage = Storage::new(StorageConfig::memory()).await?;
        let id = JobId::new();

        assert!(storage.fetch_artifact(id, ArtifactFormat::Obj).await?.is_none());
        assert!(storage.manifest(id).await?.is_none());

        let path = storage
            .publish_artifacts(
                id,
                vec![
                    (ArtifactFormat::Obj, Bytes::from_static(b"v 0 0 0\n")),
                    (ArtifactFormat::Ply, Bytes::from_static(b"ply\n")),
                ],
            )
            .await?;
        assert_eq!(path, artifact_prefix(id));

        let obj = storage.fetch_artifact(id, ArtifactFormat::Obj).await?;
        assert_eq!(obj, Some(Bytes::from_static(b"v 0 0 0\n")));
        let manifest = storage.manifest(id).await?.expect("manifest");
        assert_eq!(manifest.formats, vec![ArtifactFormat::Obj, ArtifactFormat::Ply]);
        assert_eq!(manifest.sizes, vec![8, 4]);
        Ok(())
    }

    #[tokio::test]
    async fn filesystem_backend_honours_prefix() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::new(StorageConfig {
            prefix: Some("/scans/".into()),
            ..StorageConfig::filesystem(dir.path())
        })
        .await?;
        assert_eq!(storage.kind(), StorageKind::Filesystem);

        storage.put_bytes("a/b.txt", Bytes::from("hi")).await?;
        assert!(dir.path().join("scans/a/b.txt").exists());
        assert_eq!(storage.get_bytes("a/b.txt").await?, Bytes::from("hi"));
        assert!(storage.try_get_bytes("a/missing").await?.is_none());
        assert!(storage.put_bytes("/", Bytes::new()).await.is_err());
        Ok(())
    }
}
