//! Gradient synchronization at accumulation boundaries.
//!
//! ```text
//! ACCUMULATING -> FLATTENED -> REDUCED -> APPLIED
//!                                     \-> SKIPPED
//! ```
//!
//! Gradients are held unscaled in f32 between boundaries. At a boundary they
//! are flattened into one buffer (times `scale / world_size`), summed across
//! ranks, checked for non-finite values and either applied or dropped. An
//! overflow is never an error: it skips the step and lowers the loss scale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use candle_core::{backprop::GradStore, DType, Device, Result, Tensor};
use rayon::prelude::*;

use crate::dist::Collective;
use crate::error::JobResult;
use crate::logging::{log_overflow_skip, log_scale_growth};
use crate::model::{GradAccumulator, NamedParam};
use crate::optim::Optimizer;
use crate::precision::{LossScaler, MasterParams};

/// Elements per overflow-scan task.
pub const OVERFLOW_CHUNK: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Accumulating,
    Flattened,
    Reduced,
    Applied,
    Skipped,
}

/// Result of one boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOutcome {
    /// [`SyncStage::Applied`] or [`SyncStage::Skipped`]
    pub stage: SyncStage,
    /// Internal optimizer step after the boundary
    pub global_step: u64,
    /// Loss scale in effect for the next micro-batch
    pub loss_scale: f64,
    /// Wall time of reduce + update
    pub update_time: Duration,
}

impl SyncOutcome {
    pub fn applied(&self) -> bool {
        self.stage == SyncStage::Applied
    }
}

enum Reduced {
    Overflow,
    Finite(Vec<Tensor>),
}

/// True iff any element is NaN or infinite. Chunks are scanned in parallel.
pub fn has_overflow(buf: &[f32]) -> bool {
    let found = AtomicBool::new(false);
    buf.par_chunks(OVERFLOW_CHUNK).for_each(|chunk| {
        if found.load(Ordering::Relaxed) {
            return;
        }
        if chunk.iter().any(|v| !v.is_finite()) {
            found.store(true, Ordering::Relaxed);
        }
    });
    found.into_inner()
}

/// Round every element through f16 and back.
fn round_through_half(buf: &mut [f32]) -> Result<()> {
    let rounded = Tensor::from_slice(buf, buf.len(), &Device::Cpu)?
        .to_dtype(DType::F16)?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?;
    buf.copy_from_slice(&rounded);
    Ok(())
}

/// Owns everything that changes at a boundary: accumulated gradients, the
/// loss scaler, master weights and the optimizer.
pub struct GradientSynchronizer {
    grads: GradAccumulator,
    scaler: LossScaler,
    masters: MasterParams,
    optimizer: Optimizer,
    allreduce_fp16: bool,
    global_step: u64,
    stage: SyncStage,
}

impl GradientSynchronizer {
    pub fn new(masters: MasterParams, optimizer: Optimizer, scaler: LossScaler, allreduce_fp16: bool) -> Self {
        let n_params = masters.vars().len();
        Self {
            grads: GradAccumulator::new(n_params),
            scaler,
            masters,
            optimizer,
            allreduce_fp16,
            global_step: 0,
            stage: SyncStage::Accumulating,
        }
    }

    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Continue counting from a resumed step.
    pub fn set_global_step(&mut self, step: u64) {
        self.global_step = step;
    }

    pub fn scale(&self) -> f64 {
        self.scaler.scale()
    }

    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }

    pub fn scaler_mut(&mut self) -> &mut LossScaler {
        &mut self.scaler
    }

    pub fn masters(&self) -> &MasterParams {
        &self.masters
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Optimizer {
        &mut self.optimizer
    }

    /// Micro-batches folded in since the last boundary.
    pub fn pending_micro_batches(&self) -> usize {
        self.grads.micro_batches()
    }

    /// Fold in one backward pass of a loss that was multiplied by [`Self::scale`].
    pub fn accumulate(&mut self, store: &GradStore, params: &[NamedParam]) -> Result<()> {
        self.stage = SyncStage::Accumulating;
        self.grads.accumulate(store, params, 1.0 / self.scaler.scale())
    }

    /// Run one boundary. Gradients are cleared whatever the outcome.
    pub fn step(&mut self, collective: &mut dyn Collective) -> JobResult<SyncOutcome> {
        let start = Instant::now();
        let result = self.reduce_and_update(collective);
        self.grads.clear();
        let stage = result?;
        Ok(SyncOutcome {
            stage,
            global_step: self.global_step,
            loss_scale: self.scaler.scale(),
            update_time: start.elapsed(),
        })
    }

    fn reduce_and_update(&mut self, collective: &mut dyn Collective) -> JobResult<SyncStage> {
        match self.reduce(collective)? {
            Reduced::Overflow => {
                let new_scale = self.scaler.on_overflow();
                log_overflow_skip(collective.rank(), new_scale);
                self.stage = SyncStage::Skipped;
            }
            Reduced::Finite(grads) => {
                self.optimizer.apply(&grads)?;
                self.global_step += 1;
                self.masters.sync_to_working()?;
                if self.scaler.on_applied() {
                    log_scale_growth(self.scaler.scale());
                }
                self.stage = SyncStage::Applied;
            }
        }
        Ok(self.stage)
    }

    fn reduce(&mut self, collective: &mut dyn Collective) -> JobResult<Reduced> {
        let vars = self.masters.vars();
        let scale = self.scaler.scale();
        let world = collective.world_size() as f64;

        let mut flat = self.grads.flatten_scaled(&vars, scale / world)?;
        self.stage = SyncStage::Flattened;

        if self.allreduce_fp16 {
            round_through_half(&mut flat)?;
        }
        collective.all_reduce_sum(&mut flat)?;
        if self.allreduce_fp16 {
            round_through_half(&mut flat)?;
        }
        self.stage = SyncStage::Reduced;

        if has_overflow(&flat) {
            return Ok(Reduced::Overflow);
        }

        let mut grads = Vec::with_capacity(vars.len());
        let mut offset = 0;
        for var in &vars {
            let t = var.as_tensor();
            let n = t.elem_count();
            let g = Tensor::from_slice(&flat[offset..offset + n], t.dims(), t.device())?;
            grads.push((g / scale)?);
            offset += n;
        }
        Ok(Reduced::Finite(grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::dist::{LocalGroup, SingleProcess};
    use crate::optim::{OptimizerKind, OptimizerSettings};
    use candle_core::Var;
    use std::thread;

    fn synchronizer(precision: Precision, scaler: LossScaler) -> Result<(Vec<NamedParam>, GradientSynchronizer)> {
        synchronizer_over(precision, scaler, &[("dense.weight", &[1.0f32, -1.0, 0.5][..])])
    }

    fn synchronizer_over(
        precision: Precision,
        scaler: LossScaler,
        values: &[(&str, &[f32])],
    ) -> Result<(Vec<NamedParam>, GradientSynchronizer)> {
        let device = Device::Cpu;
        let dtype = match precision {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
        };
        let params = values
            .iter()
            .map(|(name, v)| {
                let t = Tensor::new(*v, &device)?.to_dtype(dtype)?;
                Ok(NamedParam::new(*name, Var::from_tensor(&t)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let masters = MasterParams::new(&params, precision)?;
        let optimizer = Optimizer::new(
            OptimizerKind::Plain,
            &params,
            masters.vars(),
            OptimizerSettings {
                lr: 0.1,
                warmup: 0.0,
                t_total: 10,
            },
        )?;
        Ok((params, GradientSynchronizer::new(masters, optimizer, scaler, false)))
    }

    #[test]
    fn test_overflow_scan() {
        let mut buf = vec![0.5f32; OVERFLOW_CHUNK * 3 + 17];
        assert!(!has_overflow(&buf));
        buf[OVERFLOW_CHUNK * 2 + 5] = f32::INFINITY;
        assert!(has_overflow(&buf));
        buf[OVERFLOW_CHUNK * 2 + 5] = f32::NAN;
        assert!(has_overflow(&buf));
        assert!(!has_overflow(&[]));
    }

    #[test]
    fn test_applied_step_advances() -> JobResult<()> {
        let (params, mut sync) = synchronizer(Precision::Fp32, LossScaler::fixed(1.0))?;
        let before = params[0].var.as_tensor().to_vec1::<f32>()?;
        sync.grads.add(0, Tensor::new(&[0.5f32, 0.5, 0.5], &Device::Cpu)?)?;

        let outcome = sync.step(&mut SingleProcess)?;
        assert!(outcome.applied());
        assert_eq!(outcome.global_step, 1);
        assert_eq!(sync.pending_micro_batches(), 0);
        assert_ne!(params[0].var.as_tensor().to_vec1::<f32>()?, before);
        Ok(())
    }

    #[test]
    fn test_overflow_skips_and_halves() -> JobResult<()> {
        let (params, mut sync) = synchronizer(Precision::Fp16, LossScaler::dynamic(4.0))?;
        sync.set_global_step(7);
        let before = params[0].var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?;

        for expected in [2.0, 1.0, 1.0] {
            sync.grads
                .add(0, Tensor::new(&[f32::INFINITY, 0.0, 0.0], &Device::Cpu)?)?;
            let outcome = sync.step(&mut SingleProcess)?;
            assert_eq!(outcome.stage, SyncStage::Skipped);
            assert_eq!(outcome.global_step, 7);
            assert_eq!(outcome.loss_scale, expected);
        }
        let after = params[0].var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert_eq!(before, after);
        assert_eq!(sync.optimizer().export_state()?.state[0].step, 0);
        Ok(())
    }

    #[test]
    fn test_overflow_anywhere_in_flat_buffer() -> JobResult<()> {
        let layout: [(&str, &[f32]); 2] = [
            ("dense.weight", &[1.0f32, -1.0, 0.5][..]),
            ("dense.bias", &[0.25f32, -0.25][..]),
        ];
        let sizes = [3usize, 2];
        for bad in [f32::INFINITY, f32::NEG_INFINITY, f32::NAN] {
            for position in 0..sizes.iter().sum::<usize>() {
                let (params, mut sync) = synchronizer_over(Precision::Fp16, LossScaler::dynamic(4.0), &layout)?;
                sync.set_global_step(7);
                let before: Vec<Vec<f32>> = params
                    .iter()
                    .map(|p| p.var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>())
                    .collect::<Result<_>>()?;

                let mut offset = 0;
                for (idx, &len) in sizes.iter().enumerate() {
                    let mut grad = vec![0.1f32; len];
                    if (offset..offset + len).contains(&position) {
                        grad[position - offset] = bad;
                    }
                    sync.grads.add(idx, Tensor::new(grad.as_slice(), &Device::Cpu)?)?;
                    offset += len;
                }

                let outcome = sync.step(&mut SingleProcess)?;
                assert_eq!(outcome.stage, SyncStage::Skipped, "{} at {}", bad, position);
                assert_eq!(outcome.global_step, 7);
                assert_eq!(outcome.loss_scale, 2.0);
                for (p, b) in params.iter().zip(&before) {
                    assert_eq!(&p.var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?, b);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_static_scale_still_skips() -> JobResult<()> {
        let (_, mut sync) = synchronizer(Precision::Fp16, LossScaler::fixed(64.0))?;
        sync.grads.add(0, Tensor::new(&[f32::NAN, 0.0, 0.0], &Device::Cpu)?)?;
        let outcome = sync.step(&mut SingleProcess)?;
        assert_eq!(outcome.stage, SyncStage::Skipped);
        assert_eq!(outcome.loss_scale, 64.0);
        Ok(())
    }

    #[test]
    fn test_half_reduction_overflows_large_sums() -> JobResult<()> {
        let (_, mut sync) = synchronizer(Precision::Fp16, LossScaler::fixed(1.0))?;
        sync.allreduce_fp16 = true;
        sync.grads.add(0, Tensor::new(&[1.0e6f32, 0.0, 0.0], &Device::Cpu)?)?;
        let outcome = sync.step(&mut SingleProcess)?;
        assert_eq!(outcome.stage, SyncStage::Skipped);
        Ok(())
    }

    #[test]
    fn test_masters_copied_to_working() -> JobResult<()> {
        let (params, mut sync) = synchronizer(Precision::Fp16, LossScaler::fixed(1.0))?;
        sync.grads.add(0, Tensor::new(&[1.0f32, 1.0, 1.0], &Device::Cpu)?)?;
        sync.step(&mut SingleProcess)?;
        let master = sync.masters().vars()[0].as_tensor().to_vec1::<f32>()?;
        let working = params[0].var.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        for (m, w) in master.iter().zip(&working) {
            assert!((m - w).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_two_ranks_reduce_to_mean() {
        let inputs = [vec![1.0f32, 2.0, 3.0], vec![3.0f32, 4.0, 5.0]];
        let handles: Vec<_> = LocalGroup::new(2)
            .into_iter()
            .zip(inputs)
            .map(|(mut collective, grad)| {
                thread::spawn(move || -> JobResult<(Vec<f32>, Vec<f32>)> {
                    let (params, mut sync) = synchronizer(Precision::Fp32, LossScaler::fixed(8.0))?;
                    sync.grads.add(0, Tensor::new(grad.as_slice(), &Device::Cpu)?)?;
                    let reduced = match sync.reduce(&mut collective)? {
                        Reduced::Finite(g) => g[0].to_vec1::<f32>()?,
                        Reduced::Overflow => panic!("unexpected overflow"),
                    };
                    sync.grads.add(0, Tensor::new(grad.as_slice(), &Device::Cpu)?)?;
                    let outcome = sync.step(&mut collective)?;
                    assert!(outcome.applied());
                    Ok((reduced, params[0].var.as_tensor().to_vec1::<f32>()?))
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        for (reduced, _) in &results {
            for (got, want) in reduced.iter().zip([2.0f32, 3.0, 4.0]) {
                assert!((got - want).abs() < 1e-5);
            }
        }
        assert_eq!(results[0].1, results[1].1);
    }
}
