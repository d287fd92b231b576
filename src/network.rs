//! Feed-forward classifier: dense, ReLU, batch norm and dropout blocks
//! followed by a dense output layer, built on candle.
//!
//! Variable names in the store (and in saved weight files):
//!
//! - `hidden{i}.dense.{weight,bias}`
//! - `hidden{i}.norm.{weight,bias,running_mean,running_var}`
//! - `output.{weight,bias}`

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Module, ModuleT, Tensor, Var, D};
use candle_nn::init::Init;
use candle_nn::{
    batch_norm, loss, ops, AdamW, BatchNorm, BatchNormConfig, Dropout, Linear, Optimizer,
    ParamsAdamW, VarBuilder, VarMap,
};
use log::debug;
use ndarray::Array2;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

const BN_EPSILON: f64 = 1e-3;
/// Weight of the current batch in the running statistics, i.e. a 0.99 decay.
const BN_MOMENTUM: f64 = 0.01;
const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-7;

/// Copies of every variable in the store, keyed by name.
pub type Snapshot = HashMap<String, Tensor>;

/// Mean loss and number of correct predictions for one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub loss: f32,
    pub correct: usize,
}

struct HiddenBlock {
    dense: Linear,
    norm: BatchNorm,
    dropout: Dropout,
}

impl HiddenBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.dense.forward(x)?.relu()?;
        let h = self.norm.forward_t(&h, train)?;
        self.dropout.forward_t(&h, train)
    }
}

/// Glorot-uniform weights and zero bias.
fn glorot_linear(inputs: usize, units: usize, vb: VarBuilder) -> candle_core::Result<Linear> {
    let limit = (6.0 / (inputs + units) as f64).sqrt();
    let weight = vb.get_with_hints(
        (units, inputs),
        "weight",
        Init::Uniform {
            lo: -limit,
            up: limit,
        },
    )?;
    let bias = vb.get_with_hints(units, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

fn norm_config() -> BatchNormConfig {
    BatchNormConfig {
        eps: BN_EPSILON,
        remove_mean: true,
        affine: true,
        momentum: BN_MOMENTUM,
    }
}

fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

pub struct Network {
    input_dim: usize,
    config: NetworkConfig,
    device: Device,
    varmap: VarMap,
    hidden: Vec<HiddenBlock>,
    output: Linear,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("input_dim", &self.input_dim)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Network {
    pub fn new(input_dim: usize, config: &NetworkConfig) -> Result<Self> {
        if input_dim == 0 || config.num_classes == 0 {
            return Err(Error::InvalidParameter(
                "network needs at least one input and one class".into(),
            ));
        }
        if config.hidden_units.len() != config.dropout.len() {
            return Err(Error::InvalidParameter(
                "hidden_units and dropout must have the same length".into(),
            ));
        }

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut hidden = Vec::with_capacity(config.hidden_units.len());
        let mut width = input_dim;
        for (i, (&units, &rate)) in config.hidden_units.iter().zip(&config.dropout).enumerate() {
            let vb = vb.pp(format!("hidden{i}"));
            hidden.push(HiddenBlock {
                dense: glorot_linear(width, units, vb.pp("dense"))?,
                norm: batch_norm(units, norm_config(), vb.pp("norm"))?,
                dropout: Dropout::new(rate),
            });
            width = units;
        }
        let output = glorot_linear(width, config.num_classes, vb.pp("output"))?;

        Ok(Self {
            input_dim,
            config: config.clone(),
            device,
            varmap,
            hidden,
            output,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable store lock poisoned".into()))?;
        let mut named: Vec<(String, Var)> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Variables updated by the optimizer; batch-norm running statistics
    /// are excluded.
    fn trainable_vars(&self) -> Result<Vec<Var>> {
        Ok(self
            .named_vars()?
            .into_iter()
            .filter(|(name, _)| !is_running_stat(name))
            .map(|(_, var)| var)
            .collect())
    }

    /// Total number of trainable parameters.
    pub fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .trainable_vars()?
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum())
    }

    /// Adam with the Keras defaults and no weight decay over the trainable
    /// variables.
    pub fn optimizer(&self, learning_rate: f32) -> Result<AdamW> {
        let params = ParamsAdamW {
            lr: learning_rate as f64,
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            eps: ADAM_EPSILON,
            weight_decay: 0.0,
        };
        Ok(AdamW::new(self.trainable_vars()?, params)?)
    }

    fn to_tensor(&self, x: &Array2<f32>) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            x.iter().copied().collect::<Vec<f32>>(),
            x.dim(),
            &self.device,
        )?)
    }

    fn check_input(&self, x: &Array2<f32>) -> Result<()> {
        if x.ncols() != self.input_dim {
            return Err(Error::InvalidDataset(format!(
                "expected {} features per row, got {}",
                self.input_dim,
                x.ncols()
            )));
        }
        Ok(())
    }

    fn logits(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = x.clone();
        for block in &self.hidden {
            h = block.forward_t(&h, train)?;
        }
        Ok(self.output.forward(&h)?)
    }

    /// Class probabilities in inference mode (running statistics, no dropout).
    pub fn predict(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_input(x)?;
        if x.nrows() == 0 {
            return Ok(Array2::zeros((0, self.num_classes())));
        }
        let probs = ops::softmax_last_dim(&self.logits(&self.to_tensor(x)?, false)?)?;
        let flat: Vec<f32> = probs.to_vec2::<f32>()?.into_iter().flatten().collect();
        Array2::from_shape_vec((x.nrows(), self.num_classes()), flat)
            .map_err(|e| Error::InvalidDataset(e.to_string()))
    }

    /// Index of the most likely class per row.
    pub fn predict_classes(&self, x: &Array2<f32>) -> Result<Vec<u8>> {
        Ok(argmax_rows(&self.predict(x)?))
    }

    /// Cross-entropy loss tensor and correct count against one-hot `y`.
    fn batch_loss(&self, x: &Array2<f32>, y: &Array2<f32>, train: bool) -> Result<(Tensor, usize)> {
        self.check_input(x)?;
        if y.dim() != (x.nrows(), self.num_classes()) {
            return Err(Error::InvalidDataset(format!(
                "targets are {:?}, expected ({}, {})",
                y.dim(),
                x.nrows(),
                self.num_classes()
            )));
        }
        let targets = self.to_tensor(y)?.argmax(D::Minus1)?;
        let logits = self.logits(&self.to_tensor(x)?, train)?;
        let loss = loss::cross_entropy(&logits, &targets)?;
        let correct = logits
            .argmax(D::Minus1)?
            .eq(&targets)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok((loss, correct as usize))
    }

    /// Mean cross-entropy and correct count in inference mode.
    pub fn evaluate(&self, x: &Array2<f32>, y: &Array2<f32>) -> Result<BatchStats> {
        if x.nrows() == 0 {
            return Ok(BatchStats {
                loss: 0.0,
                correct: 0,
            });
        }
        let (loss, correct) = self.batch_loss(x, y, false)?;
        Ok(BatchStats {
            loss: loss.to_scalar::<f32>()?,
            correct,
        })
    }

    /// One training-mode forward pass, backward pass and optimizer update.
    /// Batch-norm running statistics move as a side effect.
    pub fn train_step(
        &mut self,
        x: &Array2<f32>,
        y: &Array2<f32>,
        optimizer: &mut AdamW,
    ) -> Result<BatchStats> {
        let (loss, correct) = self.batch_loss(x, y, true)?;
        optimizer.backward_step(&loss)?;
        Ok(BatchStats {
            loss: loss.to_scalar::<f32>()?,
            correct,
        })
    }

    /// Deep copy of every variable, running statistics included.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.named_vars()?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }

    /// Writes a snapshot back into the live variables.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        for (name, tensor) in snapshot {
            self.varmap.set_one(name.as_str(), tensor)?;
        }
        Ok(())
    }

    /// Saves every variable as safetensors.
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        debug!("weights saved to {}", path.display());
        Ok(())
    }

    /// Loads weights saved by a network of the same shape.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "weights file not found"),
            ));
        }
        self.varmap.load(path)?;
        Ok(())
    }
}

/// Row-wise argmax, e.g. to turn one-hot rows back into labels.
pub fn argmax_rows(x: &Array2<f32>) -> Vec<u8> {
    x.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0 as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            hidden_units: vec![16, 8],
            dropout: vec![0.0, 0.0],
            num_classes: 3,
        }
    }

    fn separable() -> (Array2<f32>, Array2<f32>) {
        let x = array![
            [1.0, 0.0],
            [0.9, 0.1],
            [0.0, 1.0],
            [0.1, 0.9],
            [-1.0, 0.0],
            [-0.9, -0.1]
        ];
        let y = array![
            [1.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 1.0]
        ];
        (x, y)
    }

    #[test]
    fn test_layer_shapes_follow_config() {
        let net = Network::new(13, &NetworkConfig::default()).unwrap();
        let snapshot = net.snapshot().unwrap();
        assert_eq!(snapshot["hidden0.dense.weight"].dims(), &[256, 13]);
        assert_eq!(snapshot["hidden1.dense.weight"].dims(), &[128, 256]);
        assert_eq!(snapshot["hidden2.norm.running_var"].dims(), &[64]);
        assert_eq!(snapshot["output.weight"].dims(), &[6, 64]);
        assert_eq!(net.num_classes(), 6);
        assert_eq!(
            net.parameter_count().unwrap(),
            13 * 256 + 256 * 3 + 256 * 128 + 128 * 3 + 128 * 64 + 64 * 3 + 64 * 6 + 6
        );
    }

    #[test]
    fn test_predict_rows_are_distributions() {
        let net = Network::new(4, &small_config()).unwrap();
        let x = array![[0.1, 0.2, 0.3, 0.4], [1.0, 0.0, 0.0, 0.0]];
        let probs = net.predict(&x).unwrap();
        assert_eq!(probs.dim(), (2, 3));
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let net = Network::new(4, &small_config()).unwrap();
        assert!(matches!(
            net.predict(&Array2::zeros((1, 5))),
            Err(Error::InvalidDataset(_))
        ));
    }

    #[test]
    fn test_mismatched_dropout_is_rejected() {
        let config = NetworkConfig {
            hidden_units: vec![8, 4],
            dropout: vec![0.1],
            num_classes: 2,
        };
        assert!(matches!(
            Network::new(3, &config),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_training_fits_separable_data() {
        let mut net = Network::new(2, &small_config()).unwrap();
        let (x, y) = separable();
        let mut adam = net.optimizer(0.01).unwrap();
        let first = net.train_step(&x, &y, &mut adam).unwrap();
        let mut last = first;
        for _ in 0..300 {
            last = net.train_step(&x, &y, &mut adam).unwrap();
        }
        assert!(last.loss < first.loss);
        assert_eq!(last.correct, 6);
    }

    #[test]
    fn test_restore_undoes_training() {
        let mut net = Network::new(2, &small_config()).unwrap();
        let (x, y) = separable();
        let before = net.predict(&x).unwrap();
        let snapshot = net.snapshot().unwrap();

        let mut adam = net.optimizer(0.05).unwrap();
        for _ in 0..5 {
            net.train_step(&x, &y, &mut adam).unwrap();
        }
        assert_ne!(net.predict(&x).unwrap(), before);

        net.restore(&snapshot).unwrap();
        assert_eq!(net.predict(&x).unwrap(), before);
    }

    #[test]
    fn test_weights_survive_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.safetensors");
        let (x, y) = separable();

        let mut net = Network::new(2, &small_config()).unwrap();
        let mut adam = net.optimizer(0.05).unwrap();
        for _ in 0..5 {
            net.train_step(&x, &y, &mut adam).unwrap();
        }
        net.save_weights(&path).unwrap();

        let mut fresh = Network::new(2, &small_config()).unwrap();
        fresh.load_weights(&path).unwrap();
        assert_eq!(fresh.predict(&x).unwrap(), net.predict(&x).unwrap());
    }

    #[test]
    fn test_missing_weights_file_is_io_error() {
        let mut net = Network::new(2, &small_config()).unwrap();
        let err = net
            .load_weights(Path::new("/nonexistent/weights.safetensors"))
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_argmax_rows() {
        let x = array![[0.1, 0.7, 0.2], [0.5, 0.1, 0.4], [0.0, 0.0, 1.0]];
        assert_eq!(argmax_rows(&x), vec![1, 0, 2]);
    }
}
