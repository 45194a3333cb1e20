//! Optimizer update rules behind one `apply` capability.
//!
//! The rule is picked once from [`OptimizerKind`]; moments and parameter
//! groups are shared so checkpoint export and the phase-2 override do not
//! depend on which rule is running.

pub mod adam;
pub mod fused;
pub mod lamb;
pub mod schedule;

use std::fmt;
use std::str::FromStr;

use candle_core::{Result, Tensor, Var};
use serde::{Deserialize, Serialize};

pub use adam::Adam;
pub use fused::FusedAdam;
pub use lamb::Lamb;
pub use schedule::warmup_linear;

use crate::checkpoint::TensorState;
use crate::model::NamedParam;

/// Decay applied to every parameter not matched by [`is_no_decay`].
pub const DEFAULT_WEIGHT_DECAY: f64 = 0.01;

const NO_DECAY_MARKERS: [&str; 4] = ["bias", "gamma", "beta", "LayerNorm"];

/// Biases and normalization parameters are excluded from weight decay.
pub fn is_no_decay(name: &str) -> bool {
    NO_DECAY_MARKERS.iter().any(|m| name.contains(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam with bias correction and L2 decay folded into the gradient
    Plain,
    /// AdamW over one flat buffer, no bias correction
    Fused,
    /// LAMB with per-layer trust ratio and warmup-linear schedule
    #[default]
    LayerAdaptive,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Plain => write!(f, "adam"),
            OptimizerKind::Fused => write!(f, "fusedadam"),
            OptimizerKind::LayerAdaptive => write!(f, "lamb"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adam" | "plain" => Ok(OptimizerKind::Plain),
            "fusedadam" | "fused" | "adamw" => Ok(OptimizerKind::Fused),
            "lamb" | "layer_adaptive" => Ok(OptimizerKind::LayerAdaptive),
            other => Err(format!(
                "Unknown optimizer: {}. Valid options: adam, fusedadam, lamb",
                other
            )),
        }
    }
}

/// Hyperparameters of one parameter (one group per parameter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    pub lr: f64,
    pub weight_decay: f64,
    /// Warmup fraction of `t_total`
    pub warmup: f64,
    /// Optimizer steps the schedule spans
    pub t_total: u64,
    pub betas: (f64, f64),
    pub eps: f64,
    /// Per-parameter gradient clip (LAMB only)
    pub max_grad_norm: f64,
}

/// Schedule and rate shared by all groups at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerSettings {
    pub lr: f64,
    pub warmup: f64,
    pub t_total: u64,
}

/// First and second moment of one parameter.
#[derive(Debug, Clone)]
pub struct Moments {
    pub step: u64,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamStateSnapshot {
    pub step: u64,
    pub exp_avg: TensorState,
    pub exp_avg_sq: TensorState,
}

/// Serializable optimizer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub param_groups: Vec<ParamGroup>,
    pub state: Vec<ParamStateSnapshot>,
}

impl OptimizerState {
    /// Rewrite the schedule for a second training phase: every parameter's
    /// step becomes `step`, and every group gets the new total, warmup and rate.
    pub fn override_phase(&mut self, step: u64, t_total: u64, warmup: f64, lr: f64) {
        for snap in &mut self.state {
            snap.step = step;
        }
        for group in &mut self.param_groups {
            group.t_total = t_total;
            group.warmup = warmup;
            group.lr = lr;
        }
    }
}

/// The update rule, selected once.
pub enum UpdateRule {
    Plain(Adam),
    Fused(FusedAdam),
    LayerAdaptive(Lamb),
}

impl UpdateRule {
    fn for_kind(kind: OptimizerKind) -> Self {
        match kind {
            OptimizerKind::Plain => UpdateRule::Plain(Adam),
            OptimizerKind::Fused => UpdateRule::Fused(FusedAdam::default()),
            OptimizerKind::LayerAdaptive => UpdateRule::LayerAdaptive(Lamb),
        }
    }

    fn apply(
        &mut self,
        vars: &[Var],
        grads: &[Tensor],
        groups: &[ParamGroup],
        moments: &mut [Moments],
    ) -> Result<()> {
        match self {
            UpdateRule::Plain(rule) => rule.apply(vars, grads, groups, moments),
            UpdateRule::Fused(rule) => rule.apply(vars, grads, groups, moments),
            UpdateRule::LayerAdaptive(rule) => rule.apply(vars, grads, groups, moments),
        }
    }
}

pub struct Optimizer {
    kind: OptimizerKind,
    vars: Vec<Var>,
    groups: Vec<ParamGroup>,
    moments: Vec<Moments>,
    rule: UpdateRule,
}

impl Optimizer {
    /// `named` supplies group names; `vars` are the tensors actually stepped
    /// (f32 masters for reduced-precision runs), in the same order.
    pub fn new(
        kind: OptimizerKind,
        named: &[NamedParam],
        vars: Vec<Var>,
        settings: OptimizerSettings,
    ) -> Result<Self> {
        if named.len() != vars.len() {
            return Err(candle_core::Error::Msg(format!(
                "optimizer got {} names for {} parameters",
                named.len(),
                vars.len()
            )));
        }
        let (betas, eps) = match kind {
            OptimizerKind::LayerAdaptive => ((0.9, 0.999), 1e-6),
            OptimizerKind::Plain | OptimizerKind::Fused => ((0.9, 0.999), 1e-8),
        };
        let groups = named
            .iter()
            .map(|p| ParamGroup {
                name: p.name.clone(),
                lr: settings.lr,
                weight_decay: if is_no_decay(&p.name) { 0.0 } else { DEFAULT_WEIGHT_DECAY },
                warmup: settings.warmup,
                t_total: settings.t_total,
                betas,
                eps,
                max_grad_norm: 1.0,
            })
            .collect();
        let moments = vars
            .iter()
            .map(|v| {
                Ok(Moments {
                    step: 0,
                    exp_avg: v.as_tensor().zeros_like()?,
                    exp_avg_sq: v.as_tensor().zeros_like()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            kind,
            vars,
            groups,
            moments,
            rule: UpdateRule::for_kind(kind),
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Apply one update from f32 gradients ordered like the parameters.
    pub fn apply(&mut self, grads: &[Tensor]) -> Result<()> {
        if grads.len() != self.vars.len() {
            return Err(candle_core::Error::Msg(format!(
                "optimizer got {} gradients for {} parameters",
                grads.len(),
                self.vars.len()
            )));
        }
        self.rule
            .apply(&self.vars, grads, &self.groups, &mut self.moments)
    }

    /// Learning rate in effect for the first group at its current step.
    pub fn current_lr(&self) -> f64 {
        let (Some(group), Some(m)) = (self.groups.first(), self.moments.first()) else {
            return 0.0;
        };
        match self.kind {
            OptimizerKind::LayerAdaptive => {
                group.lr * warmup_linear(schedule::progress(m.step, group.t_total), group.warmup)
            }
            OptimizerKind::Plain | OptimizerKind::Fused => group.lr,
        }
    }

    pub fn export_state(&self) -> Result<OptimizerState> {
        let state = self
            .moments
            .iter()
            .map(|m| {
                Ok(ParamStateSnapshot {
                    step: m.step,
                    exp_avg: TensorState::from_tensor(&m.exp_avg)?,
                    exp_avg_sq: TensorState::from_tensor(&m.exp_avg_sq)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(OptimizerState {
            kind: self.kind,
            param_groups: self.groups.clone(),
            state,
        })
    }

    pub fn import_state(&mut self, state: &OptimizerState) -> Result<()> {
        if state.kind != self.kind {
            return Err(candle_core::Error::Msg(format!(
                "optimizer kind mismatch: running {}, checkpoint has {}",
                self.kind, state.kind
            )));
        }
        if state.state.len() != self.moments.len() || state.param_groups.len() != self.groups.len() {
            return Err(candle_core::Error::Msg(format!(
                "optimizer state mismatch: expected {} parameters, got {} states and {} groups",
                self.moments.len(),
                state.state.len(),
                state.param_groups.len()
            )));
        }

        let mut restored = Vec::with_capacity(state.state.len());
        for (idx, snap) in state.state.iter().enumerate() {
            let var = self.vars[idx].as_tensor();
            let load = |t: &TensorState| -> Result<Tensor> {
                if t.shape != var.dims() {
                    return Err(candle_core::Error::Msg(format!(
                        "optimizer state shape mismatch at index {}: expected {:?}, got {:?}",
                        idx,
                        var.dims(),
                        t.shape
                    )));
                }
                t.to_tensor(var.device())
            };
            restored.push(Moments {
                step: snap.step,
                exp_avg: load(&snap.exp_avg)?,
                exp_avg_sq: load(&snap.exp_avg_sq)?,
            });
        }

        self.moments = restored;
        self.groups = state.param_groups.clone();
        Ok(())
    }
}

/// L2 norm of a tensor as f64.
pub(crate) fn l2_norm(t: &Tensor) -> Result<f64> {
    Ok((t.sqr()?.sum_all()?.to_scalar::<f32>()? as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn params(device: &Device) -> Result<Vec<NamedParam>> {
        Ok(vec![
            NamedParam::new("dense.weight", Var::from_tensor(&Tensor::new(&[1.0f32, -1.0, 0.5], device)?)?),
            NamedParam::new("dense.bias", Var::from_tensor(&Tensor::new(&[0.1f32], device)?)?),
        ])
    }

    fn settings() -> OptimizerSettings {
        OptimizerSettings {
            lr: 0.1,
            warmup: 0.1,
            t_total: 100,
        }
    }

    fn grads(device: &Device) -> Result<Vec<Tensor>> {
        Ok(vec![
            Tensor::new(&[0.5f32, -0.5, 0.25], device)?,
            Tensor::new(&[1.0f32], device)?,
        ])
    }

    #[test]
    fn test_no_decay_names() {
        assert!(is_no_decay("head.bias"));
        assert!(is_no_decay("LayerNorm.gamma"));
        assert!(is_no_decay("encoder.LayerNorm.weight"));
        assert!(!is_no_decay("embeddings.weight"));
    }

    #[test]
    fn test_kind_parse_and_display() {
        for (s, k) in [
            ("adam", OptimizerKind::Plain),
            ("fusedadam", OptimizerKind::Fused),
            ("LAMB", OptimizerKind::LayerAdaptive),
        ] {
            let parsed: OptimizerKind = s.parse().unwrap();
            assert_eq!(parsed, k);
            assert_eq!(parsed.to_string().parse::<OptimizerKind>().unwrap(), k);
        }
        assert!("sgd".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_groups_one_per_param() -> Result<()> {
        let device = Device::Cpu;
        let named = params(&device)?;
        let vars = named.iter().map(|p| p.var.clone()).collect();
        let opt = Optimizer::new(OptimizerKind::LayerAdaptive, &named, vars, settings())?;
        assert_eq!(opt.groups().len(), 2);
        assert_eq!(opt.groups()[0].weight_decay, DEFAULT_WEIGHT_DECAY);
        assert_eq!(opt.groups()[1].weight_decay, 0.0);
        assert_eq!(opt.groups()[0].t_total, 100);
        Ok(())
    }

    #[test]
    fn test_every_rule_moves_params() -> Result<()> {
        let device = Device::Cpu;
        for kind in [OptimizerKind::Plain, OptimizerKind::Fused, OptimizerKind::LayerAdaptive] {
            let named = params(&device)?;
            let before = named[0].var.as_tensor().to_vec1::<f32>()?;
            let vars = named.iter().map(|p| p.var.clone()).collect();
            let mut opt = Optimizer::new(kind, &named, vars, settings())?;
            opt.apply(&grads(&device)?)?;
            let after = named[0].var.as_tensor().to_vec1::<f32>()?;
            assert_ne!(before, after, "{} left parameters unchanged", kind);
            // Positive gradient pushes the weight down.
            assert!(after[0] < before[0], "{}", kind);
            assert!(after.iter().all(|v| v.is_finite()));
        }
        Ok(())
    }

    #[test]
    fn test_apply_rejects_wrong_grad_count() -> Result<()> {
        let device = Device::Cpu;
        let named = params(&device)?;
        let vars = named.iter().map(|p| p.var.clone()).collect();
        let mut opt = Optimizer::new(OptimizerKind::Plain, &named, vars, settings())?;
        assert!(opt.apply(&grads(&device)?[..1]).is_err());
        Ok(())
    }

    #[test]
    fn test_state_roundtrip_and_override() -> Result<()> {
        let device = Device::Cpu;
        let named = params(&device)?;
        let vars: Vec<Var> = named.iter().map(|p| p.var.clone()).collect();
        let mut opt = Optimizer::new(OptimizerKind::LayerAdaptive, &named, vars.clone(), settings())?;
        opt.apply(&grads(&device)?)?;
        opt.apply(&grads(&device)?)?;

        let mut state = opt.export_state()?;
        assert_eq!(state.state[0].step, 2);
        let json = serde_json::to_string(&state).unwrap();
        let back: OptimizerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.param_groups, state.param_groups);

        state.override_phase(5, 400, 0.2, 0.004);
        let mut fresh = Optimizer::new(OptimizerKind::LayerAdaptive, &named, vars, settings())?;
        fresh.import_state(&state)?;
        let exported = fresh.export_state()?;
        assert!(exported.state.iter().all(|s| s.step == 5));
        assert!(exported
            .param_groups
            .iter()
            .all(|g| g.t_total == 400 && g.warmup == 0.2 && g.lr == 0.004));
        assert_eq!(exported.state[0].exp_avg.data, back.state[0].exp_avg.data);
        Ok(())
    }

    #[test]
    fn test_import_rejects_other_kind() -> Result<()> {
        let device = Device::Cpu;
        let named = params(&device)?;
        let vars: Vec<Var> = named.iter().map(|p| p.var.clone()).collect();
        let adam = Optimizer::new(OptimizerKind::Plain, &named, vars.clone(), settings())?;
        let mut lamb = Optimizer::new(OptimizerKind::LayerAdaptive, &named, vars, settings())?;
        assert!(lamb.import_state(&adam.export_state()?).is_err());
        Ok(())
    }

    #[test]
    fn test_lamb_lr_follows_warmup() -> Result<()> {
        let device = Device::Cpu;
        let named = params(&device)?;
        let vars = named.iter().map(|p| p.var.clone()).collect();
        let mut opt = Optimizer::new(OptimizerKind::LayerAdaptive, &named, vars, settings())?;
        assert_eq!(opt.current_lr(), 0.0);
        opt.apply(&grads(&device)?)?;
        // step 1 of 100 with 10% warmup
        assert!((opt.current_lr() - 0.1 * 0.1).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_l2_norm() -> Result<()> {
        let t = Tensor::new(&[3.0f32, 4.0], &Device::Cpu)?.to_dtype(DType::F32)?;
        assert!((l2_norm(&t)? - 5.0).abs() < 1e-6);
        Ok(())
    }
}
