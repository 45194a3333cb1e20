//! Adam with bias correction; weight decay enters as an L2 term on the gradient.

use candle_core::{Result, Tensor, Var};

use super::{Moments, ParamGroup};

/// Update rule:
///   1. g += wd * p
///   2. m = b1*m + (1-b1)*g,  v = b2*v + (1-b2)*g^2
///   3. p -= lr / (1-b1^t) * m / (sqrt(v) / sqrt(1-b2^t) + eps)
#[derive(Debug, Default, Clone, Copy)]
pub struct Adam;

impl Adam {
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

            let grad = if group.weight_decay > 0.0 {
                (grad + (&param * group.weight_decay)?)?
            } else {
                grad.clone()
            };

            m.step += 1;
            m.exp_avg = ((&m.exp_avg * beta1)? + (&grad * (1.0 - beta1))?)?;
            m.exp_avg_sq = ((&m.exp_avg_sq * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let bias1 = 1.0 - beta1.powi(m.step as i32);
            let bias2 = 1.0 - beta2.powi(m.step as i32);
            let denom = ((m.exp_avg_sq.sqrt()? / bias2.sqrt())? + group.eps)?;
            let step_size = group.lr / bias1;

            let update = (m.exp_avg.div(&denom)? * step_size)?;
            var.set(&param.sub(&update)?)?;
        }
        Ok(())
    }
}
