//! Model capability consumed by the coordinator, plus a small reference model.

use candle_core::{backprop::GradStore, DType, Device, Result, Tensor, Var, D};
use candle_nn::{Embedding, Linear, Module};
use rand::{Rng, SeedableRng};

use crate::config::ModelShape;
use crate::data::Batch;

/// A trainable tensor with its stable name.
#[derive(Debug, Clone)]
pub struct NamedParam {
    pub name: String,
    pub var: Var,
}

impl NamedParam {
    pub fn new(name: impl Into<String>, var: Var) -> Self {
        Self {
            name: name.into(),
            var,
        }
    }

    pub fn elem_count(&self) -> usize {
        self.var.as_tensor().elem_count()
    }
}

/// What the orchestrator needs from a model.
pub trait TrainableModel: Send {
    /// Trainable parameters in a fixed order that is identical on every rank.
    fn parameters(&self) -> &[NamedParam];

    /// Mean loss of one micro-batch as an f32 scalar, differentiable w.r.t.
    /// [`TrainableModel::parameters`].
    fn loss(&self, batch: &Batch) -> Result<Tensor>;

    fn device(&self) -> &Device;

    fn vars(&self) -> Vec<Var> {
        self.parameters().iter().map(|p| p.var.clone()).collect()
    }

    fn num_params(&self) -> usize {
        self.parameters().iter().map(NamedParam::elem_count).sum()
    }
}

/// Embedding -> LayerNorm -> linear head, trained on next-token cross-entropy.
pub struct TokenPredictor {
    params: Vec<NamedParam>,
    hidden_size: usize,
    layer_norm_eps: f64,
    device: Device,
}

const EMBEDDINGS: usize = 0;
const LN_GAMMA: usize = 1;
const LN_BETA: usize = 2;
const HEAD_WEIGHT: usize = 3;
const HEAD_BIAS: usize = 4;

impl TokenPredictor {
    /// Build with weights drawn from a seeded generator so every rank and
    /// every run starts from the same values.
    pub fn new(shape: &ModelShape, dtype: DType, seed: u64, device: &Device) -> Result<Self> {
        let vocab = shape.padded_vocab_size();
        let hidden = shape.hidden_size;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut uniform = |n: usize, bound: f32| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        let make = |data: Vec<f32>, dims: Vec<usize>| -> Result<Var> {
            Var::from_tensor(&Tensor::from_vec(data, dims, device)?.to_dtype(dtype)?)
        };

        let head_bound = (1.0 / hidden as f32).sqrt();
        let params = vec![
            NamedParam::new("embeddings.weight", make(uniform(vocab * hidden, 0.05), vec![vocab, hidden])?),
            NamedParam::new("LayerNorm.gamma", make(vec![1.0; hidden], vec![hidden])?),
            NamedParam::new("LayerNorm.beta", make(vec![0.0; hidden], vec![hidden])?),
            NamedParam::new("head.weight", make(uniform(vocab * hidden, head_bound), vec![vocab, hidden])?),
            NamedParam::new("head.bias", make(vec![0.0; vocab], vec![vocab])?),
        ];

        Ok(Self {
            params,
            hidden_size: hidden,
            layer_norm_eps: shape.layer_norm_eps,
            device: device.clone(),
        })
    }

    fn tensor(&self, idx: usize) -> &Tensor {
        self.params[idx].var.as_tensor()
    }

    fn layer_norm(&self, x: &Tensor) -> Result<Tensor> {
        let gamma = self.tensor(LN_GAMMA).to_dtype(DType::F32)?;
        let beta = self.tensor(LN_BETA).to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.layer_norm_eps)?.sqrt()?)?;
        normed.broadcast_mul(&gamma)?.broadcast_add(&beta)
    }
}

impl TrainableModel for TokenPredictor {
    fn parameters(&self) -> &[NamedParam] {
        &self.params
    }

    fn loss(&self, batch: &Batch) -> Result<Tensor> {
        let dtype = self.tensor(EMBEDDINGS).dtype();
        let ids = batch.input_ids.flatten_all()?;
        let targets = batch.target_ids.flatten_all()?;

        let embedding = Embedding::new(self.tensor(EMBEDDINGS).clone(), self.hidden_size);
        let x = embedding.forward(&ids)?;

        // Normalization statistics stay in f32 regardless of parameter width.
        let x = self.layer_norm(&x.to_dtype(DType::F32)?)?.to_dtype(dtype)?;

        let head = Linear::new(
            self.tensor(HEAD_WEIGHT).clone(),
            Some(self.tensor(HEAD_BIAS).clone()),
        );
        let logits = head.forward(&x)?.to_dtype(DType::F32)?;
        candle_nn::loss::cross_entropy(&logits, &targets)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Copy every parameter into one f32 host buffer, in parameter order.
pub fn flatten_params(params: &[NamedParam]) -> Result<Vec<f32>> {
    let mut flat = Vec::with_capacity(params.iter().map(NamedParam::elem_count).sum());
    for p in params {
        flat.extend(
            p.var
                .as_tensor()
                .flatten_all()?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?,
        );
    }
    Ok(flat)
}

/// Inverse of [`flatten_params`]; casts back to each parameter's dtype.
pub fn assign_flat(params: &[NamedParam], flat: &[f32]) -> Result<()> {
    let total: usize = params.iter().map(NamedParam::elem_count).sum();
    if flat.len() != total {
        return Err(candle_core::Error::Msg(format!(
            "flat parameter buffer has {} elements, model has {}",
            flat.len(),
            total
        )));
    }
    let mut offset = 0;
    for p in params {
        let t = p.var.as_tensor();
        let n = t.elem_count();
        let value = Tensor::from_slice(&flat[offset..offset + n], t.dims(), t.device())?
            .to_dtype(t.dtype())?;
        p.var.set(&value)?;
        offset += n;
    }
    Ok(())
}

/// Running sum of unscaled f32 gradients between optimizer steps.
#[derive(Debug, Default)]
pub struct GradAccumulator {
    grads: Vec<Option<Tensor>>,
    micro_batches: usize,
}

impl GradAccumulator {
    pub fn new(n_params: usize) -> Self {
        Self {
            grads: vec![None; n_params],
            micro_batches: 0,
        }
    }

    /// Fold one backward pass in, multiplying by `inv_scale` to undo loss scaling.
    pub fn accumulate(&mut self, store: &GradStore, params: &[NamedParam], inv_scale: f64) -> Result<()> {
        for (idx, p) in params.iter().enumerate() {
            if let Some(g) = store.get(p.var.as_tensor()) {
                let g = (g.to_dtype(DType::F32)? * inv_scale)?;
                self.add(idx, g)?;
            }
        }
        self.micro_batches += 1;
        Ok(())
    }

    /// Add an f32 gradient for parameter `idx`.
    pub fn add(&mut self, idx: usize, grad: Tensor) -> Result<()> {
        let slot = self.grads.get_mut(idx).ok_or_else(|| {
            candle_core::Error::Msg(format!("gradient index {} out of range", idx))
        })?;
        *slot = Some(match slot.take() {
            Some(acc) => (acc + grad)?,
            None => grad,
        });
        Ok(())
    }

    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    /// One contiguous buffer of every gradient times `factor`; parameters
    /// without a gradient contribute zeros.
    pub fn flatten_scaled(&self, shapes: &[Var], factor: f64) -> Result<Vec<f32>> {
        let total: usize = shapes.iter().map(|v| v.as_tensor().elem_count()).sum();
        let mut flat = Vec::with_capacity(total);
        for (idx, var) in shapes.iter().enumerate() {
            match self.grads.get(idx).and_then(Option::as_ref) {
                Some(g) => flat.extend((g * factor)?.flatten_all()?.to_vec1::<f32>()?),
                None => flat.extend(std::iter::repeat(0.0f32).take(var.as_tensor().elem_count())),
            }
        }
        Ok(flat)
    }

    pub fn clear(&mut self) {
        for g in &mut self.grads {
            *g = None;
        }
        self.micro_batches = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_shape() -> ModelShape {
        ModelShape {
            vocab_size: 13,
            hidden_size: 4,
            layer_norm_eps: 1e-5,
        }
    }

    fn tiny_batch(device: &Device) -> Result<Batch> {
        Batch::from_rows(
            &[vec![1, 2, 3], vec![4, 5, 6]],
            &[vec![2, 3, 4], vec![5, 6, 7]],
            device,
        )
    }

    #[test]
    fn test_parameters_stable_and_padded() -> Result<()> {
        let model = TokenPredictor::new(&tiny_shape(), DType::F32, 1, &Device::Cpu)?;
        let names: Vec<_> = model.parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["embeddings.weight", "LayerNorm.gamma", "LayerNorm.beta", "head.weight", "head.bias"]
        );
        assert_eq!(model.parameters()[0].var.as_tensor().dims(), &[16, 4]);
        assert_eq!(model.num_params(), 16 * 4 + 4 + 4 + 16 * 4 + 16);
        Ok(())
    }

    #[test]
    fn test_seeded_init_is_reproducible() -> Result<()> {
        let a = TokenPredictor::new(&tiny_shape(), DType::F32, 7, &Device::Cpu)?;
        let b = TokenPredictor::new(&tiny_shape(), DType::F32, 7, &Device::Cpu)?;
        assert_eq!(flatten_params(a.parameters())?, flatten_params(b.parameters())?);
        Ok(())
    }

    #[test]
    fn test_loss_and_gradients() -> Result<()> {
        let device = Device::Cpu;
        let model = TokenPredictor::new(&tiny_shape(), DType::F32, 3, &device)?;
        let loss = model.loss(&tiny_batch(&device)?)?;
        let value = loss.to_scalar::<f32>()?;
        // Near-uniform logits over 16 classes.
        assert!(value.is_finite() && (value - (16f32).ln()).abs() < 1.5);

        let store = loss.backward()?;
        let mut acc = GradAccumulator::new(model.parameters().len());
        acc.accumulate(&store, model.parameters(), 1.0)?;
        let flat = acc.flatten_scaled(&model.vars(), 1.0)?;
        assert_eq!(flat.len(), model.num_params());
        assert!(flat.iter().any(|g| *g != 0.0));
        Ok(())
    }

    #[test]
    fn test_half_precision_loss_is_f32() -> Result<()> {
        let device = Device::Cpu;
        let model = TokenPredictor::new(&tiny_shape(), DType::F16, 3, &device)?;
        assert_eq!(model.parameters()[0].var.as_tensor().dtype(), DType::F16);
        let loss = model.loss(&tiny_batch(&device)?)?;
        assert_eq!(loss.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_flatten_assign_roundtrip() -> Result<()> {
        let a = TokenPredictor::new(&tiny_shape(), DType::F32, 1, &Device::Cpu)?;
        let b = TokenPredictor::new(&tiny_shape(), DType::F32, 2, &Device::Cpu)?;
        let flat = flatten_params(a.parameters())?;
        assign_flat(b.parameters(), &flat)?;
        assert_eq!(flatten_params(b.parameters())?, flat);
        assert!(assign_flat(b.parameters(), &flat[1..]).is_err());
        Ok(())
    }

    #[test]
    fn test_accumulator_sums_and_clears() -> Result<()> {
        let device = Device::Cpu;
        let vars = vec![
            Var::from_tensor(&Tensor::zeros(2, DType::F32, &device)?)?,
            Var::from_tensor(&Tensor::zeros(3, DType::F32, &device)?)?,
        ];
        let mut acc = GradAccumulator::new(2);
        acc.add(0, Tensor::new(&[1.0f32, 2.0], &device)?)?;
        acc.add(0, Tensor::new(&[0.5f32, 0.5], &device)?)?;
        assert_eq!(acc.flatten_scaled(&vars, 2.0)?, vec![3.0, 5.0, 0.0, 0.0, 0.0]);
        assert!(acc.add(5, Tensor::new(&[1.0f32], &device)?).is_err());

        acc.clear();
        assert_eq!(acc.flatten_scaled(&vars, 1.0)?, vec![0.0; 5]);
        Ok(())
    }
}
