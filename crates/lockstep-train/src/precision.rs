//! Loss scaling and f32 master weights for reduced-precision training.

use candle_core::{DType, Result, Var};
use serde::{Deserialize, Serialize};

use crate::checkpoint::TensorState;
use crate::config::{LossScaleMode, Precision, INITIAL_LOSS_SCALE};
use crate::model::NamedParam;

/// The scale never drops below this.
pub const MIN_LOSS_SCALE: f64 = 1.0;
/// Growth stops here.
pub const MAX_LOSS_SCALE: f64 = 16_777_216.0; // 2^24
/// Clean optimizer steps between doublings.
pub const GROWTH_INTERVAL: u64 = 2000;

/// Multiplier applied to the loss before backward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScaler {
    scale: f64,
    dynamic: bool,
    clean_steps: u64,
    growth_interval: u64,
}

impl LossScaler {
    /// Scaler for a run; full-precision runs always use a fixed scale of 1.
    pub fn new(mode: LossScaleMode, precision: Precision) -> Self {
        match (precision, mode) {
            (Precision::Fp32, _) => Self::fixed(1.0),
            (Precision::Fp16, LossScaleMode::Dynamic) => Self::dynamic(INITIAL_LOSS_SCALE),
            (Precision::Fp16, LossScaleMode::Static { scale }) => Self::fixed(scale),
        }
    }

    pub fn dynamic(initial: f64) -> Self {
        Self {
            scale: initial.clamp(MIN_LOSS_SCALE, MAX_LOSS_SCALE),
            dynamic: true,
            clean_steps: 0,
            growth_interval: GROWTH_INTERVAL,
        }
    }

    pub fn fixed(scale: f64) -> Self {
        Self {
            scale,
            dynamic: false,
            clean_steps: 0,
            growth_interval: GROWTH_INTERVAL,
        }
    }

    pub fn with_growth_interval(mut self, interval: u64) -> Self {
        self.growth_interval = interval.max(1);
        self
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Record a skipped step. Returns the scale now in effect.
    pub fn on_overflow(&mut self) -> f64 {
        if self.dynamic {
            self.scale = (self.scale / 2.0).max(MIN_LOSS_SCALE);
        }
        self.clean_steps = 0;
        self.scale
    }

    /// Record an applied step. Returns true when the scale grew.
    pub fn on_applied(&mut self) -> bool {
        if !self.dynamic {
            return false;
        }
        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval && self.scale < MAX_LOSS_SCALE {
            self.scale = (self.scale * 2.0).min(MAX_LOSS_SCALE);
            self.clean_steps = 0;
            return true;
        }
        false
    }

    /// Adopt a scale saved in a checkpoint.
    pub fn restore(&mut self, scale: f64) {
        self.scale = if self.dynamic {
            scale.clamp(MIN_LOSS_SCALE, MAX_LOSS_SCALE)
        } else {
            scale
        };
        self.clean_steps = 0;
    }
}

/// Optimizer-facing copy of the parameters.
///
/// For reduced-precision models the optimizer updates f32 shadows and the
/// working parameters are refreshed from them after each applied step. For
/// f32 models the optimizer updates the working parameters directly.
pub struct MasterParams {
    working: Vec<NamedParam>,
    shadow: Option<Vec<Var>>,
}

impl MasterParams {
    pub fn new(params: &[NamedParam], precision: Precision) -> Result<Self> {
        let shadow = if precision.is_reduced() {
            Some(
                params
                    .iter()
                    .map(|p| Var::from_tensor(&p.var.as_tensor().to_dtype(DType::F32)?))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            None
        };
        Ok(Self {
            working: params.to_vec(),
            shadow,
        })
    }

    pub fn is_reduced(&self) -> bool {
        self.shadow.is_some()
    }

    /// The tensors the optimizer steps.
    pub fn vars(&self) -> Vec<Var> {
        match &self.shadow {
            Some(shadow) => shadow.clone(),
            None => self.working.iter().map(|p| p.var.clone()).collect(),
        }
    }

    /// Copy master values into the working parameters.
    pub fn sync_to_working(&self) -> Result<()> {
        if let Some(shadow) = &self.shadow {
            for (master, p) in shadow.iter().zip(&self.working) {
                let cast = master.as_tensor().to_dtype(p.var.as_tensor().dtype())?;
                p.var.set(&cast)?;
            }
        }
        Ok(())
    }

    /// Snapshot of the f32 shadows, `None` for full-precision runs.
    pub fn export(&self) -> Result<Option<Vec<TensorState>>> {
        self.shadow
            .as_ref()
            .map(|shadow| {
                shadow
                    .iter()
                    .map(|v| TensorState::from_tensor(v.as_tensor()))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()
    }

    /// Overwrite the shadows element by element from a snapshot.
    pub fn restore(&self, saved: &[TensorState]) -> Result<()> {
        let Some(shadow) = &self.shadow else {
            return Ok(());
        };
        if saved.len() != shadow.len() {
            return Err(candle_core::Error::Msg(format!(
                "master param count mismatch: expected {}, got {}",
                shadow.len(),
                saved.len()
            )));
        }
        for (idx, (var, snap)) in shadow.iter().zip(saved).enumerate() {
            let tensor = snap.to_tensor(var.as_tensor().device()).map_err(|e| {
                candle_core::Error::Msg(format!("master param {}: {}", idx, e))
            })?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(candle_core::Error::Msg(format!(
                    "master param shape mismatch at index {}: expected {:?}, got {:?}",
                    idx,
                    var.as_tensor().dims(),
                    snap.shape
                )));
            }
            var.set(&tensor)?;
        }
        Ok(())
    }
}
