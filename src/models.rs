use std::collections::BTreeSet;
use std::ops::Range;

use candle_nn::Optimizer;
use log::{debug, info};
use ndarray::{Array2, Axis};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{NetworkConfig, TrainConfig};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::metrics::{ClassificationReport, ConfusionMatrix};
use crate::network::{argmax_rows, Network, Snapshot};

/// Train/test partition of a dataset.
#[derive(Debug, Clone)]
pub struct Split {
    pub x_train: Array2<f32>,
    pub x_test: Array2<f32>,
    pub y_train: Vec<u8>,
    pub y_test: Vec<u8>,
}

fn rows_to_array(x: &[Vec<f32>], indices: &[usize], dim: usize) -> Result<Array2<f32>> {
    let flat: Vec<f32> = indices.iter().flat_map(|&i| x[i].iter().copied()).collect();
    Array2::from_shape_vec((indices.len(), dim), flat)
        .map_err(|e| Error::InvalidDataset(e.to_string()))
}

/// Splits per class so both partitions keep the class proportions; each
/// class sends `round(n * (1 - test_fraction))` rows to training.
pub fn stratified_split<R: Rng + ?Sized>(
    dataset: &Dataset,
    test_fraction: f32,
    rng: &mut R,
) -> Result<Split> {
    let dim = dataset.feature_dim()?;
    let (x, y) = (&dataset.features, &dataset.labels);
    let train_perc = 1.0 - test_fraction;

    let mut train_indices: Vec<usize> = Vec::new();
    let mut test_indices: Vec<usize> = Vec::new();

    let unique_classes = y.iter().copied().collect::<BTreeSet<u8>>();

    for class in unique_classes {
        let mut indices = y
            .iter()
            .enumerate()
            .filter(|(_, &c)| class == c)
            .map(|(i, _)| i)
            .collect::<Vec<usize>>();

        let n_samples = indices.len();
        let n_train = (n_samples as f32 * train_perc).round() as usize;
        indices.shuffle(rng);

        train_indices.extend_from_slice(&indices[..n_train]);
        test_indices.extend_from_slice(&indices[n_train..]);
    }

    train_indices.shuffle(rng);
    test_indices.shuffle(rng);

    Ok(Split {
        x_train: rows_to_array(x, &train_indices, dim)?,
        x_test: rows_to_array(x, &test_indices, dim)?,
        y_train: train_indices.iter().map(|&i| y[i]).collect(),
        y_test: test_indices.iter().map(|&i| y[i]).collect(),
    })
}

/// Scales every row to unit L2 norm; all-zero rows are left as they are.
pub fn l2_normalize(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    out
}

pub fn one_hot(labels: &[u8], num_classes: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label as usize >= num_classes {
            return Err(Error::InvalidDataset(format!(
                "label {label} out of range for {num_classes} classes"
            )));
        }
        encoded[[row, label as usize]] = 1.0;
    }
    Ok(encoded)
}

/// Per-epoch training metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub loss: Vec<f32>,
    pub accuracy: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub val_accuracy: Vec<f32>,
    pub learning_rate: Vec<f32>,
}

impl History {
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }
}

/// Halves (by `factor`) the learning rate when the validation loss has not
/// improved by `min_delta` for `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f32,
    patience: usize,
    min_delta: f32,
    min_lr: f32,
    best: f32,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f32, patience: usize, min_delta: f32, min_lr: f32) -> Self {
        Self {
            factor,
            patience,
            min_delta,
            min_lr,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    /// Returns the new learning rate when a reduction is due.
    pub fn observe(&mut self, val_loss: f32, lr: f32) -> Option<f32> {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        self.wait = 0;
        (lr > self.min_lr).then(|| (lr * self.factor).max(self.min_lr))
    }
}

/// Stops after `patience` epochs without a lower validation loss. Once it
/// has fired, the weights of the best epoch can be put back.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f32,
    best_epoch: usize,
    wait: usize,
    stopped: bool,
    best_weights: Option<Snapshot>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            best_epoch: 0,
            wait: 0,
            stopped: false,
            best_weights: None,
        }
    }

    /// Records the epoch; returns true when training should stop.
    pub fn observe(&mut self, epoch: usize, val_loss: f32, network: &Network) -> Result<bool> {
        if val_loss < self.best {
            self.best = val_loss;
            self.best_epoch = epoch;
            self.wait = 0;
            self.best_weights = Some(network.snapshot()?);
            return Ok(false);
        }
        self.wait += 1;
        self.stopped = self.wait >= self.patience && epoch > 0;
        Ok(self.stopped)
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Puts the best epoch's weights back into `network` if training was
    /// stopped early. A run that used every epoch keeps its final weights.
    /// Returns whether anything was restored.
    pub fn restore_best(&self, network: &mut Network) -> Result<bool> {
        match (&self.best_weights, self.stopped) {
            (Some(weights), true) => {
                network.restore(weights)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Index ranges of the mini-batches. A trailing single row is folded into
/// the previous batch since batch norm needs two rows for its variance.
fn batch_ranges(n: usize, batch_size: usize) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = (0..n)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(n))
        .collect();
    if ranges.len() > 1 && ranges.last().is_some_and(|r| r.len() == 1) {
        if let Some(last) = ranges.pop() {
            if let Some(prev) = ranges.last_mut() {
                prev.end = last.end;
            }
        }
    }
    ranges
}

/// Mini-batch training with the test partition as validation data.
pub fn fit<R: Rng + ?Sized>(
    network: &mut Network,
    x_train: &Array2<f32>,
    y_train: &Array2<f32>,
    x_val: &Array2<f32>,
    y_val: &Array2<f32>,
    config: &TrainConfig,
    rng: &mut R,
) -> Result<History> {
    let n = x_train.nrows();
    if n < 2 {
        return Err(Error::InvalidDataset(format!(
            "training partition has {n} rows, need at least 2"
        )));
    }
    if config.batch_size < 2 {
        return Err(Error::InvalidParameter(
            "batch_size must be at least 2".into(),
        ));
    }

    let mut optimizer = network.optimizer(config.learning_rate)?;
    let mut plateau = ReduceLrOnPlateau::new(
        config.plateau_factor,
        config.plateau_patience,
        config.plateau_min_delta,
        config.min_learning_rate,
    );
    let mut stopper = EarlyStopping::new(config.early_stop_patience);
    let mut history = History::default();
    let mut order: Vec<usize> = (0..n).collect();
    let batches = batch_ranges(n, config.batch_size);

    for epoch in 0..config.epochs {
        order.shuffle(rng);
        let mut loss_sum = 0.0;
        let mut correct = 0;
        for range in &batches {
            let batch = &order[range.clone()];
            let xb = x_train.select(Axis(0), batch);
            let yb = y_train.select(Axis(0), batch);
            let stats = network.train_step(&xb, &yb, &mut optimizer)?;
            loss_sum += stats.loss * batch.len() as f32;
            correct += stats.correct;
        }

        let loss = loss_sum / n as f32;
        let accuracy = correct as f32 / n as f32;
        let (val_loss, val_accuracy) = if x_val.nrows() > 0 {
            let val = network.evaluate(x_val, y_val)?;
            (val.loss, val.correct as f32 / x_val.nrows() as f32)
        } else {
            (loss, accuracy)
        };

        let lr = optimizer.learning_rate() as f32;
        history.loss.push(loss);
        history.accuracy.push(accuracy);
        history.val_loss.push(val_loss);
        history.val_accuracy.push(val_accuracy);
        history.learning_rate.push(lr);
        info!(
            "epoch {}/{} - loss: {loss:.4} - accuracy: {accuracy:.4} - val_loss: {val_loss:.4} - val_accuracy: {val_accuracy:.4}",
            epoch + 1,
            config.epochs
        );

        if let Some(new_lr) = plateau.observe(val_loss, lr) {
            info!("epoch {}: reducing learning rate to {new_lr:e}", epoch + 1);
            optimizer.set_learning_rate(new_lr as f64);
        }
        if stopper.observe(epoch, val_loss, network)? {
            info!("epoch {}: early stopping", epoch + 1);
            break;
        }
    }

    if stopper.restore_best(network)? {
        debug!("restored weights from epoch {}", stopper.best_epoch() + 1);
    }
    Ok(history)
}

/// Held-out scores and reports of a fitted network.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub test_loss: f32,
    pub test_accuracy: f32,
    pub train_report: ClassificationReport,
    pub test_report: ClassificationReport,
    pub train_confusion: ConfusionMatrix,
    pub test_confusion: ConfusionMatrix,
}

/// Everything produced by a training run.
#[derive(Debug)]
pub struct TrainingOutcome {
    pub network: Network,
    pub history: History,
    pub evaluation: Evaluation,
}

/// Split, normalize, encode, train and evaluate.
pub fn train_model(
    dataset: &Dataset,
    class_names: &[String],
    network_config: &NetworkConfig,
    config: &TrainConfig,
) -> Result<TrainingOutcome> {
    let num_classes = network_config.num_classes;
    if class_names.len() != num_classes {
        return Err(Error::InvalidParameter(format!(
            "{} class names for {num_classes} outputs",
            class_names.len()
        )));
    }
    let mut rng = StdRng::seed_from_u64(config.seed);

    let split = stratified_split(dataset, config.test_fraction, &mut rng)?;
    info!(
        "split: {} train rows, {} test rows",
        split.y_train.len(),
        split.y_test.len()
    );

    let x_train = l2_normalize(&split.x_train);
    let x_test = l2_normalize(&split.x_test);
    let y_train = one_hot(&split.y_train, num_classes)?;
    let y_test = one_hot(&split.y_test, num_classes)?;

    let mut network = Network::new(x_train.ncols(), network_config)?;
    info!("network: {} trainable parameters", network.parameter_count()?);

    let history = fit(&mut network, &x_train, &y_train, &x_test, &y_test, config, &mut rng)?;

    let (test_loss, test_accuracy) = if split.y_test.is_empty() {
        (0.0, 0.0)
    } else {
        let stats = network.evaluate(&x_test, &y_test)?;
        (stats.loss, stats.correct as f32 / split.y_test.len() as f32)
    };
    info!("test accuracy: {test_accuracy:.2}");

    let train_pred = network.predict_classes(&x_train)?;
    let test_pred = network.predict_classes(&x_test)?;
    let train_true = argmax_rows(&y_train);
    let test_true = argmax_rows(&y_test);

    let evaluation = Evaluation {
        test_loss,
        test_accuracy,
        train_report: ClassificationReport::new(&train_true, &train_pred, class_names),
        test_report: ClassificationReport::new(&test_true, &test_pred, class_names),
        train_confusion: ConfusionMatrix::new(&train_true, &train_pred, class_names),
        test_confusion: ConfusionMatrix::new(&test_true, &test_pred, class_names),
    };
    Ok(TrainingOutcome {
        network,
        history,
        evaluation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::collections::HashMap;

    fn dataset(x: Vec<Vec<f32>>, y: Vec<u8>) -> Dataset {
        Dataset {
            features: x,
            labels: y,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn test_no_duplicates_between_train_and_test() {
        let data = dataset(
            vec![
                vec![1.0, 2.0],
                vec![3.0, 4.0],
                vec![5.0, 6.0],
                vec![7.0, 8.0],
                vec![9.0, 10.0],
            ],
            vec![0, 1, 0, 1, 0],
        );
        let split = stratified_split(&data, 0.4, &mut rng()).unwrap();

        let train_vec: Vec<f32> = split.x_train.iter().copied().collect();
        let test_vec: Vec<f32> = split.x_test.iter().copied().collect();

        assert!(train_vec.iter().all(|val| !test_vec.contains(val)));
        assert_eq!(train_vec.len() + test_vec.len(), 10);
    }

    #[test]
    fn test_x_train_is_60_percent() {
        let data = dataset(
            vec![
                vec![1.0, 2.0],
                vec![3.0, 4.0],
                vec![5.0, 6.0],
                vec![7.0, 8.0],
                vec![9.0, 10.0],
            ],
            vec![0, 1, 0, 1, 0],
        );
        let split = stratified_split(&data, 0.4, &mut rng()).unwrap();

        let expected_train_size = (data.len() as f32 * 3.0 / 5.0) as usize;
        assert_eq!(split.x_train.nrows(), expected_train_size);
    }

    fn count_classes(y: &[u8]) -> HashMap<u8, usize> {
        let mut class_counts = HashMap::new();
        for &label in y {
            *class_counts.entry(label).or_insert(0) += 1;
        }
        class_counts
    }

    #[test]
    fn test_stratified_split_even_distribution() {
        let x: Vec<Vec<f32>> = (0..6).map(|i| vec![i as f32, i as f32 + 1.0]).collect();
        let y = vec![0, 1, 0, 1, 0, 1];
        let split = stratified_split(&dataset(x, y.clone()), 1.0 / 3.0, &mut rng()).unwrap();

        let train_class_counts = count_classes(&split.y_train);
        let test_class_counts = count_classes(&split.y_test);
        let total_class_counts = count_classes(&y);

        for (class, count) in train_class_counts {
            let test_count = test_class_counts.get(&class).cloned().unwrap_or(0);
            let total_count = total_class_counts.get(&class).cloned().unwrap_or(0);
            assert_eq!(
                count + test_count,
                total_count,
                "train and test counts don't add up to total count"
            );
            assert_eq!(count, 2, "train count for class {} is incorrect", class);
            assert_eq!(test_count, 1, "test count for class {} is incorrect", class);
        }
    }

    #[test]
    fn test_split_keeps_proportions_on_unbalanced_classes() {
        let mut y = vec![0u8; 40];
        y.extend(vec![1u8; 20]);
        y.extend(vec![2u8; 10]);
        let x = (0..y.len()).map(|i| vec![i as f32]).collect();
        let split = stratified_split(&dataset(x, y), 0.2, &mut rng()).unwrap();

        let test = count_classes(&split.y_test);
        assert_eq!(test[&0u8], 8);
        assert_eq!(test[&1u8], 4);
        assert_eq!(test[&2u8], 2);
        assert_eq!(split.y_train.len(), 56);
    }

    #[test]
    fn test_split_is_deterministic_for_a_seed() {
        let x: Vec<Vec<f32>> = (0..20).map(|i| vec![i as f32]).collect();
        let y = (0..20).map(|i| (i % 4) as u8).collect();
        let data = dataset(x, y);
        let a = stratified_split(&data, 0.2, &mut rng()).unwrap();
        let b = stratified_split(&data, 0.2, &mut rng()).unwrap();
        assert_eq!(a.y_train, b.y_train);
        assert_eq!(a.x_test, b.x_test);
    }

    #[test]
    fn test_l2_normalize_rows() {
        let x = array![[3.0, 4.0], [0.0, 0.0], [1.0, 1.0]];
        let normed = l2_normalize(&x);
        assert!((normed[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((normed[[0, 1]] - 0.8).abs() < 1e-6);
        assert_eq!(normed.row(1).to_vec(), vec![0.0, 0.0]);
        let norm = normed.row(2).dot(&normed.row(2)).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_one_hot() {
        let encoded = one_hot(&[2, 0, 5], 6).unwrap();
        assert_eq!(encoded.dim(), (3, 6));
        assert_eq!(encoded[[0, 2]], 1.0);
        assert_eq!(encoded[[1, 0]], 1.0);
        assert_eq!(encoded[[2, 5]], 1.0);
        assert_eq!(encoded.sum(), 3.0);
        assert!(one_hot(&[6], 6).is_err());
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 3, 1e-4, 1e-5);
        assert_eq!(plateau.observe(1.0, 0.05), None);
        assert_eq!(plateau.observe(1.0, 0.05), None);
        assert_eq!(plateau.observe(1.0, 0.05), None);
        assert_eq!(plateau.observe(1.0, 0.05), Some(0.025));
        // counter restarts after a reduction
        assert_eq!(plateau.observe(1.0, 0.025), None);
        assert_eq!(plateau.observe(0.5, 0.025), None);
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 1, 0.0, 1e-5);
        plateau.observe(1.0, 1.5e-5);
        assert_eq!(plateau.observe(1.0, 1.5e-5), Some(1e-5));
        assert_eq!(plateau.observe(1.0, 1e-5), None);
    }

    fn tiny_network() -> Network {
        let config = NetworkConfig {
            hidden_units: vec![4],
            dropout: vec![0.0],
            num_classes: 2,
        };
        Network::new(2, &config).unwrap()
    }

    fn nudge(network: &mut Network) {
        let x = array![[1.0, 0.0], [0.0, 1.0], [0.9, 0.1], [0.1, 0.9]];
        let y = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]];
        let mut adam = network.optimizer(0.05).unwrap();
        for _ in 0..5 {
            network.train_step(&x, &y, &mut adam).unwrap();
        }
    }

    #[test]
    fn test_early_stopping_restores_best_weights_when_fired() {
        let rows = array![[0.3, 0.7], [0.8, 0.2]];
        let mut network = tiny_network();
        let mut stopper = EarlyStopping::new(2);

        assert!(!stopper.observe(0, 0.5, &network).unwrap());
        let best = network.predict(&rows).unwrap();
        nudge(&mut network);
        assert!(!stopper.observe(1, 0.6, &network).unwrap());
        nudge(&mut network);
        assert!(stopper.observe(2, 0.7, &network).unwrap());
        assert!(stopper.stopped());
        assert_eq!(stopper.best_epoch(), 0);

        assert!(stopper.restore_best(&mut network).unwrap());
        assert_eq!(network.predict(&rows).unwrap(), best);
    }

    #[test]
    fn test_early_stopping_keeps_last_weights_without_stop() {
        let rows = array![[0.3, 0.7], [0.8, 0.2]];
        let mut network = tiny_network();
        let mut stopper = EarlyStopping::new(5);

        assert!(!stopper.observe(0, 0.5, &network).unwrap());
        nudge(&mut network);
        assert!(!stopper.observe(1, 0.9, &network).unwrap());
        let last = network.predict(&rows).unwrap();

        assert!(!stopper.stopped());
        assert!(!stopper.restore_best(&mut network).unwrap());
        assert_eq!(network.predict(&rows).unwrap(), last);
    }

    #[test]
    fn test_batch_ranges_fold_single_trailing_row() {
        assert_eq!(batch_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(batch_ranges(9, 4), vec![0..4, 4..9]);
        assert_eq!(batch_ranges(3, 32), vec![0..3]);
    }

    #[test]
    fn test_fit_without_early_stop_runs_every_epoch() {
        let x = array![[1.0, 0.0], [0.0, 1.0], [0.9, 0.1], [0.1, 0.9], [0.8, 0.2]];
        let y = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0], [1.0, 0.0]];
        let config = TrainConfig {
            epochs: 4,
            batch_size: 2,
            early_stop_patience: 10,
            ..TrainConfig::default()
        };
        let mut network = tiny_network();
        let history = fit(&mut network, &x, &y, &x, &y, &config, &mut rng()).unwrap();
        assert_eq!(history.epochs(), 4);
        assert_eq!(history.learning_rate.len(), 4);
        assert!(history.loss.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_fit_rejects_single_row_batches() {
        let x = array![[1.0, 0.0], [0.0, 1.0]];
        let y = array![[1.0, 0.0], [0.0, 1.0]];
        let config = TrainConfig {
            batch_size: 1,
            ..TrainConfig::default()
        };
        let err = fit(&mut tiny_network(), &x, &y, &x, &y, &config, &mut rng()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_train_model_on_separable_clusters() {
        let mut r = rng();
        let mut data = Dataset::default();
        for class in 0..3u8 {
            for _ in 0..30 {
                let mut row = vec![0.05f32; 4];
                row[class as usize] = 1.0 + r.gen_range(-0.1..0.1);
                data.push(row, class);
            }
        }
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let network = NetworkConfig {
            hidden_units: vec![16, 8],
            dropout: vec![0.1, 0.1],
            num_classes: 3,
        };
        let config = TrainConfig {
            learning_rate: 0.01,
            epochs: 40,
            batch_size: 8,
            ..TrainConfig::default()
        };

        let outcome = train_model(&data, &names, &network, &config).unwrap();
        let scores = &outcome.evaluation;
        assert!((0.0..=1.0).contains(&scores.test_accuracy));
        assert!(scores.test_accuracy > 0.8, "accuracy {}", scores.test_accuracy);
        assert!(outcome.history.epochs() >= 1 && outcome.history.epochs() <= 40);
        assert_eq!(scores.test_confusion.total(), 18);
        assert_eq!(scores.train_confusion.total(), 72);
    }

    #[test]
    fn test_train_model_rejects_name_mismatch() {
        let data = dataset(vec![vec![1.0]], vec![0]);
        let names = ["a".to_string()];
        let err = train_model(&data, &names, &NetworkConfig::default(), &TrainConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }
}
