//! AdamW over all parameters at once: one flat buffer, no bias correction,
//! decoupled weight decay.

use candle_core::{Result, Tensor, Var};

use super::{Moments, ParamGroup};

#[derive(Debug, Default)]
pub struct FusedAdam {
    /// Per-element weight decay, built on first use.
    decay: Option<Tensor>,
}

fn flat_cat(tensors: &[&Tensor]) -> Result<Tensor> {
    let flat = tensors
        .iter()
        .map(|t| t.flatten_all())
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&flat, 0)
}

impl FusedAdam {
    pub fn apply(
        &mut self,
        vars: &[Var],
        grads: &[Tensor],
        groups: &[ParamGroup],
        moments: &mut [Moments],
    ) -> Result<()> {
        let Some(first) = groups.first() else {
            return Ok(());
        };
        // Hyperparameters other than decay are uniform across groups.
        let (beta1, beta2) = first.betas;
        let (lr, eps) = (first.lr, first.eps);

        let params: Vec<Tensor> = vars.iter().map(|v| v.as_tensor().detach()).collect();
        let sizes: Vec<usize> = params.iter().map(Tensor::elem_count).collect();

        if self.decay.is_none() {
            let mut decay = Vec::with_capacity(sizes.iter().sum());
            for (group, &n) in groups.iter().zip(&sizes) {
                decay.extend(std::iter::repeat(group.weight_decay as f32).take(n));
            }
            self.decay = Some(Tensor::from_vec(decay, sizes.iter().sum::<usize>(), first_device(vars)?)?);
        }
        let decay = self.decay.as_ref().ok_or_else(|| candle_core::Error::Msg("decay buffer missing".into()))?;

        let p = flat_cat(&params.iter().collect::<Vec<_>>())?;
        let g = flat_cat(&grads.iter().collect::<Vec<_>>())?;
        let m = flat_cat(&moments.iter().map(|s| &s.exp_avg).collect::<Vec<_>>())?;
        let v = flat_cat(&moments.iter().map(|s| &s.exp_avg_sq).collect::<Vec<_>>())?;

        let m = ((m * beta1)? + (&g * (1.0 - beta1))?)?;
        let v = ((v * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
        let update = (m.div(&(v.sqrt()? + eps)?)? + p.mul(decay)?)?;
        let p = p.sub(&(update * lr)?)?;

        let mut offset = 0;
        for ((var, state), &n) in vars.iter().zip(moments.iter_mut()).zip(&sizes) {
            let dims = var.as_tensor().dims().to_vec();
            var.set(&p.narrow(0, offset, n)?.reshape(dims.as_slice())?)?;
            state.exp_avg = m.narrow(0, offset, n)?.reshape(dims.as_slice())?;
            state.exp_avg_sq = v.narrow(0, offset, n)?.reshape(dims.as_slice())?;
            state.step += 1;
            offset += n;
        }
        Ok(())
    }
}

fn first_device(vars: &[Var]) -> Result<&candle_core::Device> {
    vars.first()
        .map(|v| v.as_tensor().device())
        .ok_or_else(|| candle_core::Error::Msg("fused update with no parameters".into()))
}
