//! Artifact formats served to clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CoreError, JobId};

/// Output formats produced by the export stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Triangle mesh in Wavefront text form.
    Obj,
    /// Coloured point cloud, ASCII PLY.
    Ply,
}

impl ArtifactFormat {
    pub const ALL: [ArtifactFormat; 2] = [ArtifactFormat::Obj, ArtifactFormat::Ply];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFormat::Obj => "obj",
            ArtifactFormat::Ply => "ply",
        }
    }

    /// File name inside a job's output directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactFormat::Obj => "mesh.obj",
            ArtifactFormat::Ply => "points.ply",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactFormat::Obj => "model/obj",
            ArtifactFormat::Ply => "application/x-ply",
        }
    }

    /// Object store key of the published artifact.
    pub fn object_key(&self, job_id: JobId) -> String {
        format!("{}/{}", artifact_prefix(job_id), self.file_name())
    }
}

/// Object store prefix under which a job's artifacts are published. This is
/// the `artifact_path` recorded on completion.
pub fn artifact_prefix(job_id: JobId) -> String {
    format!("jobs/{job_id}")
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "obj" => Ok(ArtifactFormat::Obj),
            "ply" => Ok(ArtifactFormat::Ply),
            other => Err(CoreError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats_case_insensitively() {
        assert_eq!("obj".parse::<ArtifactFormat>().unwrap(), ArtifactFormat::Obj);
        assert_eq!("PLY".parse::<ArtifactFormat>().unwrap(), ArtifactFormat::Ply);
        assert!(matches!(
            "fbx".parse::<ArtifactFormat>(),
            Err(CoreError::UnsupportedFormat(f)) if f == "fbx"
        ));
    }

    #[test]
    fn keys_live_under_the_job_prefix() {
        let id = JobId::new();
        let key = ArtifactFormat::Ply.object_key(id);
        assert!(key.starts_with(&artifact_prefix(id)));
        assert!(key.ends_with("points.ply"));
    }
}
