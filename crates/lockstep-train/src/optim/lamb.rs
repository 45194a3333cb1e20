//! LAMB: Adam moments with a per-parameter trust ratio.

use candle_core::{Result, Tensor, Var};

use super::schedule::{progress, warmup_linear};
use super::{l2_norm, Moments, ParamGroup};

/// Update rule per parameter:
///   1. clip g to `max_grad_norm`
///   2. m = b1*m + (1-b1)*g,  v = b2*v + (1-b2)*g^2
///   3. u = m / (sqrt(v) + eps) + wd * p
///   4. p -= lr * warmup_linear(t / t_total, warmup) * (|p| / |u|) * u
#[derive(Debug, Default, Clone, Copy)]
pub struct Lamb;

impl Lamb {
    pub fn apply(
        &mut self,
        vars: &[Var],
        grads: &[Tensor],
        groups: &[ParamGroup],
        moments: &mut [Moments],
    ) -> Result<()> {
        for (((var, grad), group), m) in vars.iter().zip(grads).zip(groups).zip(moments.iter_mut()) {
            let (beta1, beta2) = group.betas;
            let param = var.as_tensor().detach();

            let grad_norm = l2_norm(grad)?;
            let grad = if group.max_grad_norm > 0.0 && grad_norm > group.max_grad_norm {
                (grad * (group.max_grad_norm / grad_norm))?
            } else {
                grad.clone()
            };

            m.step += 1;
            m.exp_avg = ((&m.exp_avg * beta1)? + (&grad * (1.0 - beta1))?)?;
            m.exp_avg_sq = ((&m.exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let mut update = m.exp_avg.div(&(m.exp_avg_sq.sqrt()? + group.eps)?)?;
            if group.weight_decay > 0.0 {
                update = (update + (&param * group.weight_decay)?)?;
            }

            let weight_norm = l2_norm(&param)?;
            let update_norm = l2_norm(&update)?;
            let trust_ratio = if weight_norm > 0.0 && update_norm > 0.0 {
                weight_norm / update_norm
            } else {
                1.0
            };

            let lr = group.lr * warmup_linear(progress(m.step, group.t_total), group.warmup);
            var.set(&param.sub(&(update * (lr * trust_ratio))?)?)?;
        }
        Ok(())
    }
}
