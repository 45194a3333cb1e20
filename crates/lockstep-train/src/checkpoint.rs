//! Checkpoint records, rotation and resume discovery.
//!
//! A checkpoint is one JSON file `ckpt_<step>.json` in the output directory,
//! written on the main rank only. At most [`KEEP_LAST`] are kept; the oldest
//! is deleted when a newer one lands.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{config_error, corrupt_checkpoint, IoResultExt, JobError, JobResult};
use crate::logging::{log_checkpoint_evicted, log_checkpoint_save};
use crate::model::NamedParam;
use crate::optim::OptimizerState;

/// Checkpoints retained on disk.
pub const KEEP_LAST: usize = 3;

/// File name prefix shared by every checkpoint.
pub const CHECKPOINT_PREFIX: &str = "ckpt";

/// Warn before saving when the filesystem is fuller than this.
const DISK_USAGE_WARN_FRACTION: f64 = 0.9;

/// Serializable tensor snapshot (f32, row-major).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorState {
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: t.dims().to_vec(),
            data: t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let expected: usize = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(candle_core::Error::Msg(format!(
                "tensor data length {} does not match shape {:?}",
                self.data.len(),
                self.shape
            )));
        }
        Tensor::from_slice(&self.data, self.shape.as_slice(), device)
    }
}

/// Everything needed to continue a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// User-visible step (phase offset applied); also encoded in the file name
    pub global_step: u64,
    pub epoch: u64,
    /// Next shard position in the epoch order
    pub shard_cursor: usize,
    /// Epoch shard order, by file name
    pub files: Vec<String>,
    pub model_state: BTreeMap<String, TensorState>,
    pub optimizer_state: OptimizerState,
    /// f32 masters; present only for reduced-precision runs
    #[serde(default)]
    pub master_params: Option<Vec<TensorState>>,
    pub loss_scale: f64,
}

/// Snapshot parameters by name.
pub fn model_state(params: &[NamedParam]) -> Result<BTreeMap<String, TensorState>> {
    params
        .iter()
        .map(|p| Ok((p.name.clone(), TensorState::from_tensor(p.var.as_tensor())?)))
        .collect()
}

/// Load a by-name snapshot into the parameters, casting to each parameter's dtype.
pub fn load_model_state(params: &[NamedParam], state: &BTreeMap<String, TensorState>) -> Result<()> {
    for p in params {
        let snap = state.get(&p.name).ok_or_else(|| {
            candle_core::Error::Msg(format!("missing parameter '{}' in checkpoint", p.name))
        })?;
        let current = p.var.as_tensor();
        if snap.shape != current.dims() {
            return Err(candle_core::Error::Msg(format!(
                "parameter '{}' shape mismatch: expected {:?}, got {:?}",
                p.name,
                current.dims(),
                snap.shape
            )));
        }
        let value = snap.to_tensor(current.device())?.to_dtype(current.dtype())?;
        p.var.set(&value)?;
    }
    Ok(())
}

/// Step encoded in a checkpoint file name: `ckpt_<digits>` optionally
/// followed by an extension.
pub fn parse_checkpoint_step(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(CHECKPOINT_PREFIX)?.strip_prefix('_')?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let (digits, tail) = rest.split_at(digits_end);
    if digits.is_empty() || !(tail.is_empty() || tail.starts_with('.')) || tail.ends_with(".tmp") {
        return None;
    }
    digits.parse().ok()
}

pub struct CheckpointManager {
    dir: PathBuf,
    keep_last: usize,
    retained: VecDeque<PathBuf>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep_last: KEEP_LAST,
            retained: VecDeque::new(),
        }
    }

    pub fn with_keep_last(mut self, keep_last: usize) -> Self {
        self.keep_last = keep_last.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the output directory. A fresh (non-resuming) job refuses a
    /// directory that already holds checkpoints.
    pub fn prepare_output_dir(dir: &Path, resuming: bool) -> JobResult<()> {
        if dir.is_dir() && !resuming {
            for entry in fs::read_dir(dir).with_path(dir)? {
                let entry = entry.with_path(dir)?;
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(CHECKPOINT_PREFIX) {
                    return Err(config_error(format!(
                        "output directory {} already contains checkpoints; resume or pick another directory",
                        dir.display()
                    )));
                }
            }
        }
        fs::create_dir_all(dir).with_path(dir)
    }

    pub fn checkpoint_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}_{}.json", CHECKPOINT_PREFIX, step))
    }

    /// Paths currently under retention, oldest first.
    pub fn retained(&self) -> impl Iterator<Item = &Path> {
        self.retained.iter().map(PathBuf::as_path)
    }

    /// Put checkpoints already on disk under retention (resumed jobs), so the
    /// bound holds across restarts.
    pub fn adopt_existing(&mut self) -> JobResult<()> {
        let mut found = Self::discover(&self.dir)?;
        found.sort_by_key(|(step, _)| *step);
        self.retained = found.into_iter().map(|(_, path)| path).collect();
        self.evict()
    }

    /// Write `record` atomically, then rotate.
    pub fn save(&mut self, record: &CheckpointRecord) -> JobResult<PathBuf> {
        self.check_disk_space();

        let path = self.checkpoint_path(record.global_step);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(record)?;
        fs::write(&tmp, json).with_path(&tmp)?;
        fs::rename(&tmp, &path).with_path(&path)?;

        self.retained.retain(|p| p != &path);
        self.retained.push_back(path.clone());
        self.evict()?;

        log_checkpoint_save(record.global_step, &path, self.retained.len());
        Ok(path)
    }

    fn evict(&mut self) -> JobResult<()> {
        while self.retained.len() > self.keep_last {
            let Some(old) = self.retained.pop_front() else {
                break;
            };
            match fs::remove_file(&old) {
                Ok(()) => log_checkpoint_evicted(&old),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_path(&old),
            }
        }
        Ok(())
    }

    fn check_disk_space(&self) {
        match disk_usage(&self.dir) {
            Ok((total, available)) if total > 0 => {
                let used = 1.0 - available as f64 / total as f64;
                if used > DISK_USAGE_WARN_FRACTION {
                    warn!(
                        dir = %self.dir.display(),
                        used_fraction = used,
                        available = %format_bytes(available),
                        "Checkpoint filesystem almost full"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Could not read filesystem usage"),
        }
    }

    /// Read one checkpoint. Unreadable JSON or missing fields are corruption.
    pub fn load(path: &Path) -> JobResult<CheckpointRecord> {
        let raw = fs::read(path).with_path(path)?;
        serde_json::from_slice(&raw).map_err(|e| corrupt_checkpoint(e.to_string(), path))
    }

    /// Every checkpoint file in `dir` with its encoded step, unsorted.
    pub fn discover(dir: &Path) -> JobResult<Vec<(u64, PathBuf)>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(dir).with_path(dir)? {
            let entry = entry.with_path(dir)?;
            let name = entry.file_name();
            if let Some(step) = name.to_str().and_then(parse_checkpoint_step) {
                found.push((step, entry.path()));
            }
        }
        Ok(found)
    }

    /// Choose and load the checkpoint to resume from.
    ///
    /// Without an explicit step the highest encoded step wins. Returns
    /// `Ok(None)` when the directory holds no checkpoints and no step was asked for.
    pub fn resume(dir: &Path, step: Option<u64>) -> JobResult<Option<(PathBuf, CheckpointRecord)>> {
        let found = Self::discover(dir)?;
        let target = match step {
            Some(s) => s,
            None => match found.iter().map(|(s, _)| *s).max() {
                Some(s) => s,
                None => return Ok(None),
            },
        };

        let mut candidates: Vec<PathBuf> = found
            .into_iter()
            .filter(|(s, _)| *s == target)
            .map(|(_, p)| p)
            .collect();
        candidates.sort();

        let path = match candidates.len() {
            0 => {
                return Err(config_error(format!(
                    "no checkpoint for step {} in {}",
                    target,
                    dir.display()
                )))
            }
            1 => candidates.remove(0),
            _ => {
                return Err(JobError::AmbiguousResume {
                    step: target,
                    candidates: candidates.iter().map(|p| p.display().to_string()).collect(),
                })
            }
        };

        let record = Self::load(&path)?;
        if record.global_step != target {
            return Err(corrupt_checkpoint(
                format!(
                    "file name encodes step {} but record holds {}",
                    target, record.global_step
                ),
                &path,
            ));
        }
        Ok(Some((path, record)))
    }
}

/// (total, available) bytes on the filesystem holding `path`.
pub fn disk_usage(path: &Path) -> std::result::Result<(u64, u64), String> {
    #[cfg(unix)]
    {
        let stats = nix::sys::statfs::statfs(path).map_err(|e| format!("Failed to get fs stats: {}", e))?;
        let total = stats.blocks() * stats.block_size() as u64;
        let available = stats.blocks_available() * stats.block_size() as u64;
        Ok((total, available))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok((0, 0))
    }
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{OptimizerKind, ParamGroup};
    use candle_core::Var;

    fn record(step: u64) -> CheckpointRecord {
        let mut model_state = BTreeMap::new();
        model_state.insert(
            "w".to_string(),
            TensorState {
                shape: vec![2],
                data: vec![step as f32, 1.0],
            },
        );
        CheckpointRecord {
            global_step: step,
            epoch: 0,
            shard_cursor: 1,
            files: vec!["training_0.bin".into(), "training_1.bin".into()],
            model_state,
            optimizer_state: OptimizerState {
                kind: OptimizerKind::LayerAdaptive,
                param_groups: vec![ParamGroup {
                    name: "w".into(),
                    lr: 1e-3,
                    weight_decay: 0.01,
                    warmup: 0.1,
                    t_total: 10,
                    betas: (0.9, 0.999),
                    eps: 1e-6,
                    max_grad_norm: 1.0,
                }],
                state: Vec::new(),
            },
            master_params: None,
            loss_scale: 1.0,
        }
    }

    #[test]
    fn test_parse_checkpoint_step() {
        assert_eq!(parse_checkpoint_step("ckpt_12.json"), Some(12));
        assert_eq!(parse_checkpoint_step("ckpt_012.pt"), Some(12));
        assert_eq!(parse_checkpoint_step("ckpt_7"), Some(7));
        assert_eq!(parse_checkpoint_step("ckpt_7.json.tmp"), None);
        assert_eq!(parse_checkpoint_step("ckpt_x.json"), None);
        assert_eq!(parse_checkpoint_step("ckpt_12abc.json"), None);
        assert_eq!(parse_checkpoint_step("model_12.json"), None);
    }

    #[test]
    fn test_retention_keeps_three_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path());
        for step in 1..=5 {
            manager.save(&record(step)).unwrap();
        }

        let mut steps: Vec<u64> = CheckpointManager::discover(dir.path())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        steps.sort_unstable();
        assert_eq!(steps, vec![3, 4, 5]);
        assert_eq!(manager.retained().count(), 3);
    }

    #[test]
    fn test_resave_same_step_not_double_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path());
        manager.save(&record(1)).unwrap();
        manager.save(&record(2)).unwrap();
        manager.save(&record(2)).unwrap();
        manager.save(&record(3)).unwrap();
        assert_eq!(CheckpointManager::discover(dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn test_adopt_existing_bounds_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut first = CheckpointManager::new(dir.path());
            for step in [10, 20, 30] {
                first.save(&record(step)).unwrap();
            }
        }
        let mut second = CheckpointManager::new(dir.path());
        second.adopt_existing().unwrap();
        second.save(&record(40)).unwrap();

        let mut steps: Vec<u64> = CheckpointManager::discover(dir.path())
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        steps.sort_unstable();
        assert_eq!(steps, vec![20, 30, 40]);
    }

    #[test]
    fn test_resume_picks_highest_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path());
        for step in [5, 15, 10] {
            manager.save(&record(step)).unwrap();
        }
        let (path, rec) = CheckpointManager::resume(dir.path(), None).unwrap().unwrap();
        assert_eq!(rec.global_step, 15);
        assert_eq!(path, manager.checkpoint_path(15));

        let (_, rec) = CheckpointManager::resume(dir.path(), Some(10)).unwrap().unwrap();
        assert_eq!(rec.global_step, 10);
        assert_eq!(rec.model_state["w"].data, vec![10.0, 1.0]);

        assert!(CheckpointManager::resume(dir.path(), Some(99)).unwrap_err().is_startup_error());
    }

    #[test]
    fn test_resume_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CheckpointManager::resume(dir.path(), None).unwrap().is_none());
    }

    #[test]
    fn test_resume_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path());
        manager.save(&record(8)).unwrap();
        fs::copy(manager.checkpoint_path(8), dir.path().join("ckpt_008.json")).unwrap();

        match CheckpointManager::resume(dir.path(), None) {
            Err(JobError::AmbiguousResume { step, candidates }) => {
                assert_eq!(step, 8);
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected AmbiguousResume, got {:?}", other.map(|o| o.map(|(p, _)| p))),
        }
    }

    #[test]
    fn test_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ckpt_4.json"), b"{}").unwrap();
        let err = CheckpointManager::resume(dir.path(), None).unwrap_err();
        assert!(matches!(err, JobError::CheckpointCorrupt { .. }));
        assert!(err.path().unwrap().ends_with("ckpt_4.json"));
    }

    #[test]
    fn test_mismatched_step_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::to_vec(&record(3)).unwrap();
        fs::write(dir.path().join("ckpt_9.json"), json).unwrap();
        let err = CheckpointManager::resume(dir.path(), None).unwrap_err();
        assert!(matches!(err, JobError::CheckpointCorrupt { .. }));
    }

    #[test]
    fn test_prepare_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run");
        CheckpointManager::prepare_output_dir(&out, false).unwrap();
        assert!(out.is_dir());

        fs::write(out.join("ckpt_1.json"), b"{}").unwrap();
        let err = CheckpointManager::prepare_output_dir(&out, false).unwrap_err();
        assert!(err.is_startup_error());
        CheckpointManager::prepare_output_dir(&out, true).unwrap();
    }

    #[test]
    fn test_model_state_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let a = vec![NamedParam::new(
            "w",
            Var::from_tensor(&Tensor::new(&[1.0f32, 2.0], &device)?)?,
        )];
        let b = vec![NamedParam::new(
            "w",
            Var::from_tensor(&Tensor::new(&[0.0f32, 0.0], &device)?.to_dtype(DType::F16)?)?,
        )];
        let state = model_state(&a)?;
        load_model_state(&b, &state)?;
        let restored = b[0].var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert_eq!(restored, vec![1.0, 2.0]);

        let wrong = vec![NamedParam::new("v", Var::from_tensor(&Tensor::new(&[0.0f32], &device)?)?)];
        assert!(load_model_state(&wrong, &state).is_err());
        Ok(())
    }

    #[test]
    fn test_tensor_state_length_check() {
        let bad = TensorState {
            shape: vec![2, 2],
            data: vec![1.0; 3],
        };
        assert!(bad.to_tensor(&Device::Cpu).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00GB");
    }
}
