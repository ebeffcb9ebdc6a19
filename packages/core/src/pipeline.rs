//! Stage pipeline definition and progress mapping.
//!
//! Stages are static configuration. Command templates reference container
//! paths through placeholders which the executor fills in per job:
//!
//! - `{input}`: read-only mount holding the uploaded bundle
//! - `{work}`: read-write scratch mount
//! - `{model}`: scratch-relative directory of the reconstructed sparse model

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{CoreError, PROGRESS_TOTAL};

pub const INPUT_PLACEHOLDER: &str = "{input}";
pub const WORK_PLACEHOLDER: &str = "{work}";
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// What to do with a stage that was interrupted by a crash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Re-running the stage on its own leftovers is safe.
    Resume,
    /// Leftovers are unsafe; wipe the scratch workspace and start over.
    #[default]
    Restart,
}

/// How a tool reports intermediate progress on its output streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPattern {
    /// No intermediate progress.
    #[default]
    None,
    /// Bracketed fractions such as `Processed file [7/20]`.
    Fraction,
    /// `Registering image #12 (5)` lines, counted against the photo count.
    RegisteredImages,
}

/// Built-in step run after a stage's tool invocation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStep {
    /// Derive `output/points.ply` and `output/mesh.obj` from the text model.
    BuildModels,
}

/// External command with placeholder arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn uses_placeholder(&self, placeholder: &str) -> bool {
        self.program.contains(placeholder) || self.args.iter().any(|a| a.contains(placeholder))
    }

    /// Substitute placeholders in the program and every argument.
    pub fn render(&self, vars: &[(&str, &str)]) -> ToolCommand {
        ToolCommand {
            program: substitute(&self.program, vars),
            args: self.args.iter().map(|a| substitute(a, vars)).collect(),
        }
    }
}

/// Replace every `(placeholder, value)` pair in `template`.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter()
        .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
}

/// The work a stage performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageAction {
    /// Unpack the uploaded bundle's images into the scratch workspace.
    IngestBundle,
    /// Invoke the reconstruction tool inside the sandbox.
    Tool(ToolCommand),
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    3600
}

/// Static description of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    pub action: StageAction,
    /// Scratch-relative paths that must exist before the stage starts.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Scratch-relative paths the stage must leave behind.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Scratch-relative directories created before the stage runs.
    #[serde(default)]
    pub scratch_dirs: Vec<String>,
    /// Relative cost used to size the stage's share of the progress counter.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Soft deadline for one attempt.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after a failed one.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    #[serde(default)]
    pub progress: ProgressPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<PostStep>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, action: StageAction) -> Self {
        Self {
            name: name.into(),
            action,
            inputs: Vec::new(),
            outputs: Vec::new(),
            scratch_dirs: Vec::new(),
            weight: default_weight(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            recovery: RecoveryPolicy::default(),
            progress: ProgressPattern::default(),
            post: None,
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_scratch_dirs(mut self, dirs: &[&str]) -> Self {
        self.scratch_dirs = dirs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_progress(mut self, progress: ProgressPattern) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_post(mut self, post: PostStep) -> Self {
        self.post = Some(post);
        self
    }

    /// Whether any template of this stage needs the sparse model directory.
    pub fn needs_model(&self) -> bool {
        let in_paths = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .any(|p| p.contains(MODEL_PLACEHOLDER));
        let in_command = match &self.action {
            StageAction::Tool(cmd) => cmd.uses_placeholder(MODEL_PLACEHOLDER),
            StageAction::IngestBundle => false,
        };
        in_paths || in_command
    }
}

/// Ordered, validated list of stages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, CoreError> {
        if stages.is_empty() {
            return Err(CoreError::InvalidPipeline("no stages".into()));
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(CoreError::InvalidPipeline("stage name is empty".into()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(CoreError::InvalidPipeline(format!(
                    "duplicate stage name {}",
                    stage.name
                )));
            }
            if stage.weight == 0 {
                return Err(CoreError::InvalidPipeline(format!(
                    "stage {} has zero weight",
                    stage.name
                )));
            }
        }
        Ok(Self { stages })
    }

    /// Load a pipeline from its JSON form (`{"stages": [...]}`).
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        #[derive(Deserialize)]
        struct PipelineFile {
            stages: Vec<StageDescriptor>,
        }
        let file: PipelineFile = serde_json::from_str(json)
            .map_err(|e| CoreError::InvalidPipeline(format!("unreadable pipeline: {e}")))?;
        Self::new(file.stages)
    }

    /// COLMAP sparse reconstruction, invoked the way the scanner backend has
    /// always run it.
    pub fn colmap_default() -> Self {
        let stages = vec![
            StageDescriptor::new("ingest-validate", StageAction::IngestBundle)
                .with_outputs(&["images"])
                .with_timeout(300)
                .with_recovery(RecoveryPolicy::Resume),
            StageDescriptor::new(
                "feature-extraction",
                StageAction::Tool(ToolCommand::new(
                    "colmap",
                    &[
                        "feature_extractor",
                        "--database_path",
                        "{work}/database.db",
                        "--image_path",
                        "{work}/images",
                        "--ImageReader.single_camera",
                        "1",
                        "--SiftExtraction.max_image_size",
                        "3200",
                        "--SiftExtraction.max_num_features",
                        "8192",
                    ],
                )),
            )
            .with_inputs(&["images"])
            .with_outputs(&["database.db"])
            .with_timeout(1800)
            .with_max_retries(1)
            .with_recovery(RecoveryPolicy::Restart)
            .with_progress(ProgressPattern::Fraction),
            StageDescriptor::new(
                "feature-matching",
                StageAction::Tool(ToolCommand::new(
                    "colmap",
                    &[
                        "exhaustive_matcher",
                        "--database_path",
                        "{work}/database.db",
                        "--ExhaustiveMatching.block_size",
                        "50",
                    ],
                )),
            )
            .with_inputs(&["database.db"])
            .with_outputs(&["database.db"])
            .with_timeout(1800)
            .with_max_retries(1)
            .with_recovery(RecoveryPolicy::Resume)
            .with_progress(ProgressPattern::Fraction),
            StageDescriptor::new(
                "sparse-reconstruction",
                StageAction::Tool(ToolCommand::new(
                    "colmap",
                    &[
                        "mapper",
                        "--database_path",
                        "{work}/database.db",
                        "--image_path",
                        "{work}/images",
                        "--output_path",
                        "{work}/sparse",
                        "--Mapper.ba_refine_focal_length",
                        "0",
                        "--Mapper.ba_refine_principal_point",
                        "0",
                        "--Mapper.ba_refine_extra_params",
                        "0",
                    ],
                )),
            )
            .with_inputs(&["database.db", "images"])
            .with_outputs(&["{model}"])
            .with_scratch_dirs(&["sparse"])
            .with_max_retries(1)
            .with_recovery(RecoveryPolicy::Restart)
            .with_progress(ProgressPattern::RegisteredImages),
            StageDescriptor::new(
                "model-refinement",
                StageAction::Tool(ToolCommand::new(
                    "colmap",
                    &[
                        "bundle_adjuster",
                        "--input_path",
                        "{work}/{model}",
                        "--output_path",
                        "{work}/{model}",
                        "--BundleAdjustment.refine_focal_length",
                        "0",
                    ],
                )),
            )
            .with_inputs(&["{model}"])
            .with_outputs(&["{model}"])
            .with_timeout(1800)
            .with_max_retries(1)
            .with_recovery(RecoveryPolicy::Restart),
            StageDescriptor::new(
                "export",
                StageAction::Tool(ToolCommand::new(
                    "colmap",
                    &[
                        "model_converter",
                        "--input_path",
                        "{work}/{model}",
                        "--output_path",
                        "{work}/output/model",
                        "--output_type",
                        "TXT",
                    ],
                )),
            )
            .with_inputs(&["{model}"])
            .with_outputs(&["output/model/points3D.txt"])
            .with_scratch_dirs(&["output/model"])
            .with_timeout(600)
            .with_max_retries(1)
            .with_recovery(RecoveryPolicy::Resume)
            .with_post(PostStep::BuildModels),
        ];
        Self { stages }
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn first(&self) -> &StageDescriptor {
        &self.stages[0]
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn progress_plan(&self) -> ProgressPlan {
        ProgressPlan::new(self.stages.iter().map(|s| s.weight), PROGRESS_TOTAL)
    }
}

/// Sub-ranges of the global progress counter owned by each stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressPlan {
    bounds: Vec<(u32, u32)>,
    total: u32,
}

impl ProgressPlan {
    pub fn new(weights: impl IntoIterator<Item = u32>, total: u32) -> Self {
        let weights: Vec<u64> = weights.into_iter().map(u64::from).collect();
        let sum: u64 = weights.iter().sum::<u64>().max(1);
        let mut cumulative = 0u64;
        let bounds = weights
            .iter()
            .map(|w| {
                let start = (total as u64 * cumulative / sum) as u32;
                cumulative += w;
                let end = (total as u64 * cumulative / sum) as u32;
                (start, end)
            })
            .collect();
        Self { bounds, total }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Global counter value when stage `index` starts.
    pub fn stage_start(&self, index: usize) -> u32 {
        self.bounds.get(index).map_or(self.total, |b| b.0)
    }

    /// Global counter value when stage `index` has finished.
    pub fn stage_end(&self, index: usize) -> u32 {
        self.bounds.get(index).map_or(self.total, |b| b.1)
    }

    /// Map a stage-local `(current, total)` report into the global counter.
    pub fn map(&self, index: usize, current: u64, total: u64) -> u32 {
        let (start, end) = match self.bounds.get(index) {
            Some(b) => *b,
            None => return self.total,
        };
        if total == 0 {
            return start;
        }
        let span = (end - start) as u64;
        let done = current.min(total);
        start + (span * done / total) as u32
    }
}
