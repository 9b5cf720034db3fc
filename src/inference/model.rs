//! Model collaborator.
//!
//! The classifier is a black box from preprocessed tile pixels to one
//! probability vector per tile. [`CommandClassifier`] drives an external
//! model process over a line-delimited JSON protocol:
//!
//! ```text
//! → {"op":"load","family":"densenet121","input_size":224,"weights":"model.hdf5","model_config":{..}}
//! ← {"ok":true}
//! → {"op":"predict","tiles":["/tmp/.../0.png","/tmp/.../1.png"]}
//! ← {"probabilities":[[..6 values..],[..6 values..]]}
//! ```
//!
//! Any response may instead carry `{"error":"message"}`.

use std::fmt;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::str::FromStr;
use std::sync::Mutex;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ModelError;

/// Classifies batches of preprocessed tiles.
///
/// Called from the blocking thread pool; implementations may block.
pub trait TileClassifier: Send + Sync {
    /// Architecture of the loaded model.
    fn family(&self) -> ModelFamily;

    /// One probability vector per input tile, in input order.
    fn predict(&self, batch: &[RgbImage]) -> Result<Vec<Vec<f32>>, ModelError>;
}

// =============================================================================
// Model description
// =============================================================================

/// Supported network architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    #[value(name = "densenet121")]
    DenseNet121,
    #[value(name = "resnext101")]
    ResNeXt101,
}

impl ModelFamily {
    /// Square input edge in pixels.
    pub fn input_size(self) -> u32 {
        match self {
            ModelFamily::DenseNet121 | ModelFamily::ResNeXt101 => 224,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelFamily::DenseNet121 => "densenet121",
            ModelFamily::ResNeXt101 => "resnext101",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compute device handed to the model process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    /// Value of `CUDA_VISIBLE_DEVICES` for the model process.
    pub fn cuda_visible_devices(self) -> String {
        match self {
            Device::Cpu => "-1".to_string(),
            Device::Gpu(index) => index.to_string(),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Cpu);
        }
        s.parse::<u32>()
            .map(Device::Gpu)
            .map_err(|_| format!("invalid device '{}': expected 'cpu' or a GPU index", s))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(index) => write!(f, "gpu:{}", index),
        }
    }
}

/// Model weights plus an optional serialized layer configuration.
///
/// A `.json` path is read as a manifest `{"weights": ..., "model_config": ...}`
/// with `weights` relative to the manifest; any other path is taken as the
/// weights file itself.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelManifest {
    pub weights: PathBuf,
    #[serde(default)]
    pub model_config: Option<Value>,
}

impl ModelManifest {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let is_manifest = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if !is_manifest {
            if !path.exists() {
                return Err(ModelError::Load(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
            return Ok(Self {
                weights: path.to_path_buf(),
                model_config: None,
            });
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| ModelError::Load(format!("{}: {}", path.display(), e)))?;
        let mut manifest: ModelManifest = serde_json::from_str(&text)
            .map_err(|e| ModelError::Load(format!("{}: {}", path.display(), e)))?;
        if manifest.weights.is_relative() {
            if let Some(dir) = path.parent() {
                manifest.weights = dir.join(&manifest.weights);
            }
        }
        if let Some(config) = manifest.model_config.as_mut() {
            sanitize_model_config(config);
        }
        Ok(manifest)
    }
}

/// Replace characters newer model loaders reject in layer names.
pub fn sanitize_layer_name(name: &str) -> String {
    name.replace(['/', ':'], "_")
}

/// Sanitize every layer name and inbound-node reference in a layer configuration.
pub fn sanitize_model_config(config: &mut Value) {
    match config {
        Value::Object(map) => {
            if let Some(Value::String(name)) = map.get_mut("name") {
                *name = sanitize_layer_name(name);
            }
            if let Some(Value::Array(nodes)) = map.get_mut("inbound_nodes") {
                for node in nodes.iter_mut() {
                    let Value::Array(connections) = node else {
                        continue;
                    };
                    for connection in connections.iter_mut() {
                        if let Some(Value::String(layer)) =
                            connection.as_array_mut().and_then(|c| c.first_mut())
                        {
                            *layer = sanitize_layer_name(layer);
                        }
                    }
                }
            }
            for value in map.values_mut() {
                sanitize_model_config(value);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_model_config),
        _ => {}
    }
}

// =============================================================================
// CommandClassifier
// =============================================================================

/// How to start the model process.
#[derive(Debug, Clone)]
pub struct ModelLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub family: ModelFamily,
    pub device: Device,
    pub manifest: ModelManifest,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Load {
        family: ModelFamily,
        input_size: u32,
        weights: &'a Path,
        model_config: Option<&'a Value>,
    },
    Predict {
        tiles: Vec<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    probabilities: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    error: Option<String>,
}

struct ChildIo {
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ChildIo {
    fn call(&mut self, request: &Request<'_>) -> Result<Response, ModelError> {
        let line = serde_json::to_string(request)
            .map_err(|e| ModelError::Invocation(format!("encode request: {}", e)))?;
        writeln!(self.stdin, "{}", line)
            .and_then(|_| self.stdin.flush())
            .map_err(|e| ModelError::Invocation(format!("write to model process: {}", e)))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .map_err(|e| ModelError::Invocation(format!("read from model process: {}", e)))?;
        if read == 0 {
            return Err(ModelError::Invocation(
                "model process closed its output".to_string(),
            ));
        }

        let response: Response = serde_json::from_str(reply.trim())
            .map_err(|e| ModelError::Invocation(format!("malformed model response: {}", e)))?;
        match response.error {
            Some(message) => Err(ModelError::Invocation(message)),
            None => Ok(response),
        }
    }
}

/// Long-lived model process, started once per run.
pub struct CommandClassifier {
    family: ModelFamily,
    child: Child,
    io: Mutex<ChildIo>,
    scratch: tempfile::TempDir,
}

impl CommandClassifier {
    /// Start the model process and load the model.
    pub fn spawn(launch: &ModelLaunch) -> Result<Self, ModelError> {
        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .env("CUDA_VISIBLE_DEVICES", launch.device.cuda_visible_devices())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ModelError::Load(format!("start {}: {}", launch.program.display(), e))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(ModelError::Load("model process has no pipes".to_string()));
        };
        let scratch = tempfile::Builder::new()
            .prefix("wsi-gleason-model.")
            .tempdir()
            .map_err(|e| ModelError::Load(format!("create scratch directory: {}", e)))?;

        let classifier = Self {
            family: launch.family,
            child,
            io: Mutex::new(ChildIo {
                stdin: BufWriter::new(stdin),
                stdout: BufReader::new(stdout),
            }),
            scratch,
        };

        let response = classifier.connection()?.call(&Request::Load {
            family: launch.family,
            input_size: launch.family.input_size(),
            weights: &launch.manifest.weights,
            model_config: launch.manifest.model_config.as_ref(),
        });
        match response {
            Ok(r) if r.ok => {}
            Ok(_) => return Err(ModelError::Load("model process did not confirm load".into())),
            Err(ModelError::Invocation(message)) => return Err(ModelError::Load(message)),
            Err(e) => return Err(e),
        }

        info!(
            program = %launch.program.display(),
            family = %launch.family,
            device = %launch.device,
            weights = %launch.manifest.weights.display(),
            "Model loaded"
        );
        Ok(classifier)
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, ChildIo>, ModelError> {
        self.io
            .lock()
            .map_err(|_| ModelError::Invocation("model connection poisoned".to_string()))
    }
}

impl TileClassifier for CommandClassifier {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn predict(&self, batch: &[RgbImage]) -> Result<Vec<Vec<f32>>, ModelError> {
        // Staged files are reused across batches, so hold the connection throughout
        let mut io = self.connection()?;
        let mut tiles = Vec::with_capacity(batch.len());
        for (i, image) in batch.iter().enumerate() {
            let path = self.scratch.path().join(format!("{}.png", i));
            image
                .save_with_format(&path, image::ImageFormat::Png)
                .map_err(|e| ModelError::Invocation(format!("stage tile {}: {}", i, e)))?;
            tiles.push(path);
        }

        debug!(tiles = batch.len(), "Sending batch to model process");
        let response = io.call(&Request::Predict { tiles })?;
        response.probabilities.ok_or_else(|| {
            ModelError::Invocation("model response carries no probabilities".to_string())
        })
    }
}

impl Drop for CommandClassifier {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
