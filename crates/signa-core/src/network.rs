//! Convolutional embedding tower.
//!
//! `[conv 3x3 same -> ReLU -> max-pool 2x2] x N -> flatten -> [dense -> ReLU] x M`.
//! The final dense layer's activations are the embedding. Tensors are
//! CHW with a single sample per pass; batches are looped by the trainer.
//!
//! Besides inference this module carries the training-side passes: a
//! forward pass that records the activations needed for backprop, and a
//! backward pass that accumulates parameter gradients.

use crate::siamese::ModelError;
use crate::types::NormalizedImage;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const KERNEL: usize = 3;
const KERNEL_AREA: usize = KERNEL * KERNEL;

/// Layer widths of the embedding tower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Output channels of each conv block, in order.
    pub conv_channels: Vec<usize>,
    /// Units of each dense layer; the last entry is the embedding size.
    pub dense_units: Vec<usize>,
    /// Dropout rate after every hidden dense layer, training only.
    #[serde(default)]
    pub dense_dropout: f32,
}

impl NetworkConfig {
    /// Four conv blocks, 128-d embedding.
    pub fn standard() -> Self {
        Self {
            conv_channels: vec![32, 64, 128, 256],
            dense_units: vec![512, 256, 128],
            dense_dropout: 0.0,
        }
    }

    /// Three conv blocks with dropout, 64-d embedding.
    pub fn compact() -> Self {
        Self {
            conv_channels: vec![32, 64, 128],
            dense_units: vec![128, 64],
            dense_dropout: 0.5,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.dense_units.last().copied().unwrap_or(0)
    }

    fn validate(&self, height: usize, width: usize) -> Result<(usize, usize), ModelError> {
        if self.dense_units.is_empty() || self.dense_units.contains(&0) {
            return Err(ModelError::InvalidConfig(
                "at least one dense layer with non-zero units is required".into(),
            ));
        }
        if self.conv_channels.contains(&0) {
            return Err(ModelError::InvalidConfig("conv channels must be non-zero".into()));
        }
        if !(0.0..1.0).contains(&self.dense_dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dense dropout {} outside [0, 1)",
                self.dense_dropout
            )));
        }
        let (mut h, mut w) = (height, width);
        for _ in &self.conv_channels {
            h /= 2;
            w /= 2;
        }
        if h == 0 || w == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "input {height}x{width} is too small for {} pooling stages",
                self.conv_channels.len()
            )));
        }
        Ok((h, w))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConvLayer {
    /// (out_channels, in_channels * 9), column order `c * 9 + ky * 3 + kx`.
    pub(crate) weight: Array2<f32>,
    pub(crate) bias: Array1<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DenseLayer {
    /// (out_units, in_units)
    pub(crate) weight: Array2<f32>,
    pub(crate) bias: Array1<f32>,
}

/// Serializable parameters of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub shape: [usize; 2],
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

/// The shared parameter set of both siamese towers.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingNetwork {
    config: NetworkConfig,
    input_height: usize,
    input_width: usize,
    pub(crate) convs: Vec<ConvLayer>,
    pub(crate) denses: Vec<DenseLayer>,
}

impl EmbeddingNetwork {
    /// Build with Glorot-uniform weights and zero biases from a seeded RNG.
    pub fn new(input_height: usize, input_width: usize, config: NetworkConfig, seed: u64) -> Result<Self, ModelError> {
        let (fh, fw) = config.validate(input_height, input_width)?;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut convs = Vec::with_capacity(config.conv_channels.len());
        let mut in_c = 1;
        for &out_c in &config.conv_channels {
            let fan_in = in_c * KERNEL_AREA;
            let fan_out = out_c * KERNEL_AREA;
            convs.push(ConvLayer {
                weight: glorot(&mut rng, out_c, fan_in, fan_in + fan_out),
                bias: Array1::zeros(out_c),
            });
            in_c = out_c;
        }

        let mut denses = Vec::with_capacity(config.dense_units.len());
        let mut in_units = in_c * fh * fw;
        for &out_units in &config.dense_units {
            denses.push(DenseLayer {
                weight: glorot(&mut rng, out_units, in_units, in_units + out_units),
                bias: Array1::zeros(out_units),
            });
            in_units = out_units;
        }

        Ok(Self {
            config,
            input_height,
            input_width,
            convs,
            denses,
        })
    }

    /// Rebuild from exported weights, checking every layer shape.
    pub fn from_weights(
        input_height: usize,
        input_width: usize,
        config: NetworkConfig,
        layers: Vec<LayerWeights>,
    ) -> Result<Self, ModelError> {
        let template = Self::new(input_height, input_width, config, 0)?;
        let expected = template.export_weights();
        if layers.len() != expected.len() {
            return Err(ModelError::WeightShape(format!(
                "expected {} layers, found {}",
                expected.len(),
                layers.len()
            )));
        }

        let mut net = template;
        let n_conv = net.convs.len();
        for (i, (layer, want)) in layers.into_iter().zip(expected.iter()).enumerate() {
            if layer.shape != want.shape
                || layer.weight.len() != want.weight.len()
                || layer.bias.len() != want.bias.len()
            {
                return Err(ModelError::WeightShape(format!(
                    "layer {i}: expected {:?} with {} biases, found {:?} with {} biases",
                    want.shape,
                    want.bias.len(),
                    layer.shape,
                    layer.bias.len()
                )));
            }
            let weight = Array2::from_shape_vec((layer.shape[0], layer.shape[1]), layer.weight)
                .map_err(|e| ModelError::WeightShape(format!("layer {i}: {e}")))?;
            let bias = Array1::from_vec(layer.bias);
            if i < n_conv {
                net.convs[i] = ConvLayer { weight, bias };
            } else {
                net.denses[i - n_conv] = DenseLayer { weight, bias };
            }
        }
        Ok(net)
    }

    /// Export all layers, conv blocks first, in forward order.
    pub fn export_weights(&self) -> Vec<LayerWeights> {
        let conv = self.convs.iter().map(|l| (&l.weight, &l.bias));
        let dense = self.denses.iter().map(|l| (&l.weight, &l.bias));
        conv.chain(dense)
            .map(|(w, b)| LayerWeights {
                shape: [w.nrows(), w.ncols()],
                weight: w.iter().copied().collect(),
                bias: b.to_vec(),
            })
            .collect()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn input_shape(&self) -> (usize, usize) {
        (self.input_height, self.input_width)
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim()
    }

    pub fn parameter_count(&self) -> usize {
        self.export_weights()
            .iter()
            .map(|l| l.weight.len() + l.bias.len())
            .sum()
    }

    fn check_input(&self, image: &NormalizedImage) -> Result<(), ModelError> {
        if image.height() != self.input_height || image.width() != self.input_width {
            return Err(ModelError::ShapeMismatch {
                expected: [self.input_height, self.input_width, 1],
                actual: image.shape(),
            });
        }
        Ok(())
    }

    /// Inference forward pass (dropout disabled).
    pub fn embed(&self, image: &NormalizedImage) -> Result<Array1<f32>, ModelError> {
        self.check_input(image)?;
        let mut x = image.to_chw();
        for layer in &self.convs {
            let (act, _) = conv_relu(layer, &x);
            x = max_pool(&act).0;
        }
        let mut v = Array1::from_iter(x.iter().copied());
        for layer in &self.denses {
            v = dense_relu(layer, v.view());
        }
        Ok(v)
    }

    /// Training forward pass recording what [`Self::backward`] needs.
    pub(crate) fn forward_train(
        &self,
        image: &NormalizedImage,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> Result<(Array1<f32>, ForwardTrace), ModelError> {
        self.check_input(image)?;
        let mut trace = ForwardTrace::default();

        let mut x = image.to_chw();
        for layer in &self.convs {
            let (act, cols) = conv_relu(layer, &x);
            let (pooled, argmax) = max_pool(&act);
            trace.convs.push(ConvTrace {
                cols,
                act_dim: act.dim(),
                act: act.iter().copied().collect(),
                argmax,
            });
            x = pooled;
        }

        let mut v = Array1::from_iter(x.iter().copied());
        let last = self.denses.len() - 1;
        for (i, layer) in self.denses.iter().enumerate() {
            let input = v;
            let mut act = dense_relu(layer, input.view());
            let active = act.mapv(|a| a > 0.0);
            let mut mask = None;
            if i < last && self.config.dense_dropout > 0.0 {
                if let Some(rng) = dropout_rng.as_deref_mut() {
                    let keep = 1.0 - self.config.dense_dropout;
                    let m = Array1::from_shape_fn(act.len(), |_| {
                        if rng.gen::<f32>() < keep {
                            1.0 / keep
                        } else {
                            0.0
                        }
                    });
                    act *= &m;
                    mask = Some(m);
                }
            }
            trace.denses.push(DenseTrace { input, active, mask });
            v = act;
        }

        Ok((v, trace))
    }

    /// Accumulate parameter gradients for one tower invocation.
    pub(crate) fn backward(&self, trace: &ForwardTrace, grad_out: ArrayView1<f32>, grads: &mut NetworkGradients) {
        let mut g = grad_out.to_owned();

        for (i, layer) in self.denses.iter().enumerate().rev() {
            let t = &trace.denses[i];
            if let Some(mask) = &t.mask {
                g *= mask;
            }
            let gz = Array1::from_shape_fn(g.len(), |k| if t.active[k] { g[k] } else { 0.0 });
            let (gw, gb) = &mut grads.denses[i];
            let outer = gz
                .view()
                .insert_axis(Axis(1))
                .dot(&t.input.view().insert_axis(Axis(0)));
            *gw += &outer;
            *gb += &gz;
            g = layer.weight.t().dot(&gz);
        }

        // Flattened CHW gradient of the current pooled map
        let mut g_flat: Vec<f32> = g.to_vec();

        for (i, layer) in self.convs.iter().enumerate().rev() {
            let t = &trace.convs[i];
            let (c, h, w) = t.act_dim;
            // Un-pool and gate by ReLU in one pass
            let mut grad_pre = Array2::<f32>::zeros((c, h * w));
            for (k, &src) in t.argmax.iter().enumerate() {
                if t.act[src] > 0.0 {
                    grad_pre[[src / (h * w), src % (h * w)]] += g_flat[k];
                }
            }

            let (gw, gb) = &mut grads.convs[i];
            *gw += &grad_pre.dot(&t.cols.t());
            *gb += &grad_pre.sum_axis(Axis(1));

            if i == 0 {
                break;
            }
            let grad_cols = layer.weight.t().dot(&grad_pre);
            let in_c = layer.weight.ncols() / KERNEL_AREA;
            g_flat = col2im(&grad_cols, in_c, h, w).iter().copied().collect();
        }
    }

    pub(crate) fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = Vec::new();
        for l in self.convs.iter_mut() {
            out.push(l.weight.view_mut().into_dyn());
            out.push(l.bias.view_mut().into_dyn());
        }
        for l in self.denses.iter_mut() {
            out.push(l.weight.view_mut().into_dyn());
            out.push(l.bias.view_mut().into_dyn());
        }
        out
    }
}

fn glorot(rng: &mut StdRng, rows: usize, cols: usize, fan_sum: usize) -> Array2<f32> {
    let limit = (6.0 / fan_sum as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

/// Unfold 3x3 same-padded patches: (C, H, W) -> (C * 9, H * W).
fn im2col(input: &Array3<f32>) -> Array2<f32> {
    let (c, h, w) = input.dim();
    let mut cols = Array2::<f32>::zeros((c * KERNEL_AREA, h * w));
    for ch in 0..c {
        for ky in 0..KERNEL {
            for kx in 0..KERNEL {
                let row = ch * KERNEL_AREA + ky * KERNEL + kx;
                let mut dst = cols.row_mut(row);
                for y in 0..h {
                    let sy = y as isize + ky as isize - 1;
                    if sy < 0 || sy >= h as isize {
                        continue;
                    }
                    for x in 0..w {
                        let sx = x as isize + kx as isize - 1;
                        if sx < 0 || sx >= w as isize {
                            continue;
                        }
                        dst[y * w + x] = input[[ch, sy as usize, sx as usize]];
                    }
                }
            }
        }
    }
    cols
}

/// Fold patch gradients back onto the input: (C * 9, H * W) -> (C, H, W).
fn col2im(cols: &Array2<f32>, c: usize, h: usize, w: usize) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros((c, h, w));
    for ch in 0..c {
        for ky in 0..KERNEL {
            for kx in 0..KERNEL {
                let row = cols.row(ch * KERNEL_AREA + ky * KERNEL + kx);
                for y in 0..h {
                    let sy = y as isize + ky as isize - 1;
                    if sy < 0 || sy >= h as isize {
                        continue;
                    }
                    for x in 0..w {
                        let sx = x as isize + kx as isize - 1;
                        if sx < 0 || sx >= w as isize {
                            continue;
                        }
                        out[[ch, sy as usize, sx as usize]] += row[y * w + x];
                    }
                }
            }
        }
    }
    out
}

/// Convolution + ReLU. Returns the activation and the unfolded input.
fn conv_relu(layer: &ConvLayer, input: &Array3<f32>) -> (Array3<f32>, Array2<f32>) {
    let (_, h, w) = input.dim();
    let cols = im2col(input);
    let mut out = layer.weight.dot(&cols);
    out += &layer.bias.view().insert_axis(Axis(1));
    out.mapv_inplace(|v| v.max(0.0));
    let out_c = out.nrows();
    let act = out
        .into_shape_with_order((out_c, h, w))
        .unwrap_or_else(|_| Array3::zeros((out_c, h, w)));
    (act, cols)
}

/// 2x2 max pool, stride 2, trailing odd row/column dropped.
/// Returns the pooled map and, per output element, the flat input index of its max.
fn max_pool(input: &Array3<f32>) -> (Array3<f32>, Vec<usize>) {
    let (c, h, w) = input.dim();
    let (ph, pw) = (h / 2, w / 2);
    let mut out = Array3::<f32>::zeros((c, ph, pw));
    let mut argmax = Vec::with_capacity(c * ph * pw);
    for ch in 0..c {
        for y in 0..ph {
            for x in 0..pw {
                let window = input.slice(s![ch, 2 * y..2 * y + 2, 2 * x..2 * x + 2]);
                let mut best = (0, 0);
                let mut best_v = f32::NEG_INFINITY;
                for ((dy, dx), &v) in window.indexed_iter() {
                    if v > best_v {
                        best_v = v;
                        best = (dy, dx);
                    }
                }
                out[[ch, y, x]] = best_v;
                argmax.push(ch * h * w + (2 * y + best.0) * w + 2 * x + best.1);
            }
        }
    }
    (out, argmax)
}

fn dense_relu(layer: &DenseLayer, input: ArrayView1<f32>) -> Array1<f32> {
    let mut z = layer.weight.dot(&input);
    z += &layer.bias;
    z.mapv_inplace(|v| v.max(0.0));
    z
}

pub(crate) struct ConvTrace {
    cols: Array2<f32>,
    /// Post-ReLU activation, flattened CHW.
    act: Vec<f32>,
    act_dim: (usize, usize, usize),
    argmax: Vec<usize>,
}

pub(crate) struct DenseTrace {
    input: Array1<f32>,
    active: Array1<bool>,
    mask: Option<Array1<f32>>,
}

#[derive(Default)]
pub(crate) struct ForwardTrace {
    convs: Vec<ConvTrace>,
    denses: Vec<DenseTrace>,
}

/// Gradients with the same layout as [`EmbeddingNetwork`]'s parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkGradients {
    pub(crate) convs: Vec<(Array2<f32>, Array1<f32>)>,
    pub(crate) denses: Vec<(Array2<f32>, Array1<f32>)>,
}

impl NetworkGradients {
    pub fn zeros_like(net: &EmbeddingNetwork) -> Self {
        let zeros = |w: &Array2<f32>, b: &Array1<f32>| (Array2::zeros(w.raw_dim()), Array1::zeros(b.len()));
        Self {
            convs: net.convs.iter().map(|l| zeros(&l.weight, &l.bias)).collect(),
            denses: net.denses.iter().map(|l| zeros(&l.weight, &l.bias)).collect(),
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for mut t in self.tensors_mut() {
            t.mapv_inplace(|v| v * factor);
        }
    }

    pub(crate) fn tensors(&self) -> Vec<ArrayViewD<'_, f32>> {
        self.convs
            .iter()
            .chain(self.denses.iter())
            .flat_map(|(w, b)| [w.view().into_dyn(), b.view().into_dyn()])
            .collect()
    }

    pub(crate) fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.convs
            .iter_mut()
            .chain(self.denses.iter_mut())
            .flat_map(|(w, b)| [w.view_mut().into_dyn(), b.view_mut().into_dyn()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> NetworkConfig {
        NetworkConfig {
            conv_channels: vec![2, 3],
            dense_units: vec![6, 4],
            dense_dropout: 0.0,
        }
    }

    fn noise_image(h: usize, w: usize, seed: u64) -> NormalizedImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..h * w).map(|_| rng.gen_range(0.0..1.0)).collect();
        NormalizedImage::from_pixels(h, w, data).unwrap()
    }

    #[test]
    fn test_variant_embedding_dims() {
        assert_eq!(NetworkConfig::standard().embedding_dim(), 128);
        assert_eq!(NetworkConfig::compact().embedding_dim(), 64);
    }

    #[test]
    fn test_embed_output_length() {
        let net = EmbeddingNetwork::new(12, 16, tiny_config(), 7).unwrap();
        let e = net.embed(&noise_image(12, 16, 1)).unwrap();
        assert_eq!(e.len(), 4);
        assert!(e.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_embed_is_deterministic() {
        let net = EmbeddingNetwork::new(12, 16, tiny_config(), 7).unwrap();
        let img = noise_image(12, 16, 2);
        assert_eq!(net.embed(&img).unwrap(), net.embed(&img).unwrap());
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let a = EmbeddingNetwork::new(12, 16, tiny_config(), 3).unwrap();
        let b = EmbeddingNetwork::new(12, 16, tiny_config(), 3).unwrap();
        let c = EmbeddingNetwork::new(12, 16, tiny_config(), 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let net = EmbeddingNetwork::new(12, 16, tiny_config(), 7).unwrap();
        let err = net.embed(&noise_image(10, 16, 1)).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_too_small_input_rejected() {
        let err = EmbeddingNetwork::new(3, 3, tiny_config(), 0).unwrap_err();
        assert!(matches!(err, ModelError::InvalidConfig(_)));
    }

    #[test]
    fn test_export_import_round_trip() {
        let net = EmbeddingNetwork::new(12, 16, tiny_config(), 9).unwrap();
        let rebuilt = EmbeddingNetwork::from_weights(12, 16, tiny_config(), net.export_weights()).unwrap();
        assert_eq!(net, rebuilt);
    }

    #[test]
    fn test_import_rejects_wrong_shape() {
        let net = EmbeddingNetwork::new(12, 16, tiny_config(), 9).unwrap();
        let mut layers = net.export_weights();
        layers[1].bias.pop();
        let err = EmbeddingNetwork::from_weights(12, 16, tiny_config(), layers).unwrap_err();
        assert!(matches!(err, ModelError::WeightShape(_)));
    }

    #[test]
    fn test_train_forward_matches_inference_without_dropout() {
        let net = EmbeddingNetwork::new(12, 16, tiny_config(), 5).unwrap();
        let img = noise_image(12, 16, 8);
        let (train_out, _) = net.forward_train(&img, None).unwrap();
        assert_eq!(train_out, net.embed(&img).unwrap());
    }

    #[test]
    fn test_im2col_col2im_adjoint() {
        // <im2col(x), y> == <x, col2im(y)>
        let mut rng = StdRng::seed_from_u64(11);
        let x = Array3::from_shape_fn((2, 4, 5), |_| rng.gen_range(-1.0..1.0f32));
        let y = Array2::from_shape_fn((18, 20), |_| rng.gen_range(-1.0..1.0f32));
        let lhs: f32 = (&im2col(&x) * &y).sum();
        let rhs: f32 = (&x * &col2im(&y, 2, 4, 5)).sum();
        assert!((lhs - rhs).abs() < 1e-4, "lhs={lhs} rhs={rhs}");
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        // Scalar objective: <embedding, r>
        let net = EmbeddingNetwork::new(8, 8, tiny_config(), 21).unwrap();
        let img = noise_image(8, 8, 4);
        let r = Array1::from(vec![0.7f32, -1.3, 0.4, 1.1]);

        let (_, trace) = net.forward_train(&img, None).unwrap();
        let mut grads = NetworkGradients::zeros_like(&net);
        net.backward(&trace, r.view(), &mut grads);
        let analytic: Vec<Vec<f32>> = grads.tensors().iter().map(|t| t.iter().copied().collect()).collect();

        let objective = |n: &EmbeddingNetwork| -> f32 { n.embed(&img).unwrap().dot(&r) };
        let eps = 1e-3f32;
        let mut checked = 0;
        let mut agreed = 0;
        let n_tensors = analytic.len();
        for t in 0..n_tensors {
            let len = analytic[t].len();
            for k in (0..len).step_by((len / 5).max(1)) {
                let mut plus = net.clone();
                plus.params_mut()[t].as_slice_mut().unwrap()[k] += eps;
                let mut minus = net.clone();
                minus.params_mut()[t].as_slice_mut().unwrap()[k] -= eps;
                let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
                let a = analytic[t][k];
                checked += 1;
                if (numeric - a).abs() <= 1e-2 + 1e-2 * a.abs() {
                    agreed += 1;
                }
            }
        }
        // ReLU kinks and pool ties may flip a few samples
        assert!(agreed * 10 >= checked * 9, "{agreed}/{checked} gradient samples agreed");
    }

    #[test]
    fn test_dropout_only_in_training() {
        let config = NetworkConfig {
            dense_dropout: 0.5,
            ..tiny_config()
        };
        let net = EmbeddingNetwork::new(12, 16, config, 5).unwrap();
        let img = noise_image(12, 16, 8);
        let mut rng = StdRng::seed_from_u64(1);
        let (_, trace) = net.forward_train(&img, Some(&mut rng)).unwrap();
        assert!(trace.denses[0].mask.is_some());
        assert!(trace.denses[1].mask.is_none());
        let (_, trace) = net.forward_train(&img, None).unwrap();
        assert!(trace.denses[0].mask.is_none());
    }
}
