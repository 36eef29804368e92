//! Contrastive training loop for the siamese model.
//!
//! Pairs are split 80/20 per label, then the shared network is optimized
//! with Adam over shuffled mini-batches. Validation loss drives both the
//! plateau learning-rate schedule and early stopping; the best weights seen
//! are restored at the end of the run.

use crate::network::{EmbeddingNetwork, NetworkGradients};
use crate::siamese::{ModelError, SiameseModel};
use crate::types::{LabeledSet, PairLabel, PairedSample};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance above which a pair is counted as `Different` for accuracy.
pub const ACCURACY_DISTANCE_THRESHOLD: f32 = 0.5;

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-7;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no training pairs were provided")]
    EmptyPairs,
    #[error("split left an empty side ({train} training / {validation} validation pairs); add more images")]
    EmptySplit { train: usize, validation: usize },
    #[error("pair references image {index} but the set holds {len}")]
    PairIndex { index: usize, len: usize },
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Hyper-parameters of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub min_learning_rate: f32,
    /// Epochs without validation improvement before stopping.
    pub early_stopping_patience: usize,
    /// Epochs without validation improvement before the learning rate decays.
    pub plateau_patience: usize,
    pub plateau_factor: f32,
    pub margin: f32,
    pub validation_fraction: f32,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 25,
            batch_size: 16,
            learning_rate: 1e-3,
            min_learning_rate: 1e-5,
            early_stopping_patience: 5,
            plateau_patience: 3,
            plateau_factor: 0.5,
            margin: 1.0,
            validation_fraction: 0.2,
            seed: 42,
        }
    }
}

impl TrainConfig {
    fn validate(&self) -> Result<(), TrainError> {
        let bad = |msg: &str| Err(TrainError::InvalidConfig(msg.to_string()));
        if self.epochs == 0 {
            return bad("epochs must be at least 1");
        }
        if self.batch_size == 0 {
            return bad("batch size must be at least 1");
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return bad("learning rate must be positive");
        }
        if !(self.plateau_factor > 0.0 && self.plateau_factor < 1.0) {
            return bad("plateau factor must lie in (0, 1)");
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return bad("validation fraction must lie in (0, 1)");
        }
        if !(self.margin > 0.0) {
            return bad("margin must be positive");
        }
        Ok(())
    }
}

/// Loss and binary accuracy over a set of pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairStats {
    pub loss: f32,
    pub accuracy: f32,
    pub pairs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based.
    pub epoch: usize,
    pub learning_rate: f32,
    pub train: PairStats,
    pub validation: PairStats,
}

/// Compact record of a run, stored in the model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_validation_loss: f32,
    pub best_validation_accuracy: f32,
    pub final_learning_rate: f32,
    pub margin: f32,
    pub stopped_early: bool,
    pub train_pairs: usize,
    pub validation_pairs: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub history: Vec<EpochMetrics>,
    pub summary: TrainingSummary,
}

/// Split pairs into (train, validation), stratified by label.
///
/// Each label's pairs are shuffled and `round(n * fraction)` of them go to
/// validation.
pub fn stratified_split(
    pairs: &[PairedSample],
    validation_fraction: f32,
    rng: &mut StdRng,
) -> (Vec<PairedSample>, Vec<PairedSample>) {
    let mut train = Vec::with_capacity(pairs.len());
    let mut validation = Vec::new();
    for label in [PairLabel::Same, PairLabel::Different] {
        let mut class: Vec<PairedSample> = pairs.iter().copied().filter(|p| p.label == label).collect();
        class.shuffle(rng);
        let n_val = (class.len() as f32 * validation_fraction).round() as usize;
        let rest = class.split_off(n_val.min(class.len()));
        validation.extend(class);
        train.extend(rest);
    }
    (train, validation)
}

/// Adam with bias correction folded into the step size.
#[derive(Debug, Clone)]
struct Adam {
    step: i32,
    m: Vec<ArrayD<f32>>,
    v: Vec<ArrayD<f32>>,
}

impl Adam {
    fn new(network: &EmbeddingNetwork) -> Self {
        let zeros: Vec<ArrayD<f32>> = NetworkGradients::zeros_like(network)
            .tensors()
            .iter()
            .map(|t| ArrayD::zeros(t.raw_dim()))
            .collect();
        Self {
            step: 0,
            m: zeros.clone(),
            v: zeros,
        }
    }

    fn apply(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: Vec<ArrayViewD<'_, f32>>, learning_rate: f32) {
        self.step += 1;
        let bc1 = 1.0 - ADAM_BETA1.powi(self.step);
        let bc2 = 1.0 - ADAM_BETA2.powi(self.step);
        let lr_t = learning_rate * bc2.sqrt() / bc1;

        for ((mut p, g), (m, v)) in params
            .into_iter()
            .zip(grads)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            Zip::from(&mut p).and(&g).and(m).and(v).for_each(|p, &g, m, v| {
                *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                *p -= lr_t * *m / (v.sqrt() + ADAM_EPSILON);
            });
        }
    }
}

/// Outcome of feeding one validation loss to [`EarlyStopping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Improved,
    Stalled,
    Stop,
}

/// Tracks the best validation loss and how long it has gone unbeaten.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f32,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    pub fn observe(&mut self, loss: f32) -> Progress {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            return Progress::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            Progress::Stop
        } else {
            Progress::Stalled
        }
    }

    pub fn best(&self) -> f32 {
        self.best
    }
}

/// Multiplies the learning rate by `factor` after `patience` stagnant
/// epochs, never going below `min`. The counter restarts after each decay.
#[derive(Debug, Clone)]
pub struct PlateauSchedule {
    learning_rate: f32,
    factor: f32,
    min: f32,
    patience: usize,
    best: f32,
    wait: usize,
}

impl PlateauSchedule {
    pub fn new(learning_rate: f32, factor: f32, min: f32, patience: usize) -> Self {
        Self {
            learning_rate,
            factor,
            min,
            patience,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Feed one validation loss; returns the learning rate for the next epoch.
    pub fn observe(&mut self, loss: f32) -> f32 {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            return self.learning_rate;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            let decayed = (self.learning_rate * self.factor).max(self.min);
            if decayed < self.learning_rate {
                tracing::info!(from = self.learning_rate, to = decayed, "reducing learning rate");
                self.learning_rate = decayed;
            }
            self.wait = 0;
        }
        self.learning_rate
    }
}

/// Step-level driver: owns optimizer state and the dropout/shuffle RNG.
#[derive(Debug)]
pub struct Trainer {
    config: TrainConfig,
    optimizer: Adam,
    schedule: PlateauSchedule,
    rng: StdRng,
}

impl Trainer {
    pub fn new(model: &SiameseModel, config: TrainConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let schedule = PlateauSchedule::new(
            config.learning_rate,
            config.plateau_factor,
            config.min_learning_rate,
            config.plateau_patience,
        );
        Ok(Self {
            optimizer: Adam::new(model.network()),
            schedule,
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(1)),
            config,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn learning_rate(&self) -> f32 {
        self.schedule.learning_rate()
    }

    /// One optimizer step on the mean contrastive loss of `batch`.
    pub fn train_batch(
        &mut self,
        model: &mut SiameseModel,
        set: &LabeledSet,
        batch: &[PairedSample],
    ) -> Result<PairStats, TrainError> {
        if batch.is_empty() {
            return Err(TrainError::EmptyPairs);
        }
        let mut grads = NetworkGradients::zeros_like(model.network());
        let mut tally = Tally::default();
        for pair in batch {
            let (a, b) = set.resolve(pair);
            let (distance, loss) =
                model.accumulate_pair(a, b, pair.label, self.config.margin, Some(&mut self.rng), &mut grads)?;
            tally.add(distance, loss, pair.label);
        }
        grads.scale(1.0 / batch.len() as f32);
        let lr = self.schedule.learning_rate();
        self.optimizer.apply(model.network.params_mut(), grads.tensors(), lr);
        Ok(tally.finish())
    }

    /// Shuffle `pairs` and run one pass of mini-batches over them.
    pub fn train_epoch(
        &mut self,
        model: &mut SiameseModel,
        set: &LabeledSet,
        pairs: &mut [PairedSample],
    ) -> Result<PairStats, TrainError> {
        pairs.shuffle(&mut self.rng);
        let mut loss_sum = 0.0;
        let mut correct = 0.0;
        for batch in pairs.chunks(self.config.batch_size) {
            let stats = self.train_batch(model, set, batch)?;
            loss_sum += stats.loss * stats.pairs as f32;
            correct += stats.accuracy * stats.pairs as f32;
        }
        let n = pairs.len().max(1) as f32;
        Ok(PairStats {
            loss: loss_sum / n,
            accuracy: correct / n,
            pairs: pairs.len(),
        })
    }

    /// Loss and accuracy without dropout or parameter updates.
    pub fn evaluate(&self, model: &SiameseModel, set: &LabeledSet, pairs: &[PairedSample]) -> Result<PairStats, TrainError> {
        evaluate(model, set, pairs, self.config.margin)
    }
}

/// Mean contrastive loss and 0.5-threshold accuracy of `model` on `pairs`.
pub fn evaluate(
    model: &SiameseModel,
    set: &LabeledSet,
    pairs: &[PairedSample],
    margin: f32,
) -> Result<PairStats, TrainError> {
    let mut tally = Tally::default();
    for pair in pairs {
        let (a, b) = set.resolve(pair);
        let distance = model.compare(a, b)?;
        tally.add(distance, model.pair_loss(distance, pair.label, margin), pair.label);
    }
    Ok(tally.finish())
}

#[derive(Default)]
struct Tally {
    loss: f32,
    correct: usize,
    n: usize,
}

impl Tally {
    fn add(&mut self, distance: f32, loss: f32, label: PairLabel) {
        let predicted_different = distance > ACCURACY_DISTANCE_THRESHOLD;
        if predicted_different == (label == PairLabel::Different) {
            self.correct += 1;
        }
        self.loss += loss;
        self.n += 1;
    }

    fn finish(self) -> PairStats {
        let n = self.n.max(1) as f32;
        PairStats {
            loss: self.loss / n,
            accuracy: self.correct as f32 / n,
            pairs: self.n,
        }
    }
}

fn check_indices(set: &LabeledSet, pairs: &[PairedSample]) -> Result<(), TrainError> {
    for pair in pairs {
        for index in [pair.first, pair.second] {
            if index >= set.len() {
                return Err(TrainError::PairIndex { index, len: set.len() });
            }
        }
    }
    Ok(())
}

/// Train `model` on `pairs` drawn from `set`.
///
/// On return the model holds the weights of the best validation epoch and
/// carries the run's [`TrainingSummary`].
pub fn train(
    model: &mut SiameseModel,
    set: &LabeledSet,
    pairs: &[PairedSample],
    config: &TrainConfig,
) -> Result<TrainingReport, TrainError> {
    if pairs.is_empty() {
        return Err(TrainError::EmptyPairs);
    }
    check_indices(set, pairs)?;
    let mut trainer = Trainer::new(model, config.clone())?;

    let mut split_rng = StdRng::seed_from_u64(config.seed);
    let (mut train_pairs, validation_pairs) = stratified_split(pairs, config.validation_fraction, &mut split_rng);
    if train_pairs.is_empty() || validation_pairs.is_empty() {
        return Err(TrainError::EmptySplit {
            train: train_pairs.len(),
            validation: validation_pairs.len(),
        });
    }

    tracing::info!(
        train_pairs = train_pairs.len(),
        validation_pairs = validation_pairs.len(),
        epochs = config.epochs,
        batch_size = config.batch_size,
        parameters = model.network().parameter_count(),
        "starting training"
    );

    let mut stopper = EarlyStopping::new(config.early_stopping_patience);
    let mut best: Option<(usize, EmbeddingNetwork, PairStats)> = None;
    let mut history = Vec::with_capacity(config.epochs);
    let mut stopped_early = false;

    for epoch in 1..=config.epochs {
        let learning_rate = trainer.learning_rate();
        let train_stats = trainer.train_epoch(model, set, &mut train_pairs)?;
        let val_stats = trainer.evaluate(model, set, &validation_pairs)?;

        tracing::info!(
            epoch,
            learning_rate,
            loss = train_stats.loss,
            accuracy = train_stats.accuracy,
            val_loss = val_stats.loss,
            val_accuracy = val_stats.accuracy,
            "epoch finished"
        );
        history.push(EpochMetrics {
            epoch,
            learning_rate,
            train: train_stats,
            validation: val_stats,
        });

        let progress = stopper.observe(val_stats.loss);
        if progress == Progress::Improved {
            best = Some((epoch, model.network().clone(), val_stats));
        }
        trainer.schedule.observe(val_stats.loss);
        if progress == Progress::Stop {
            tracing::info!(epoch, best_val_loss = stopper.best(), "early stopping");
            stopped_early = true;
            break;
        }
    }

    let (best_epoch, best_validation) = match best {
        Some((epoch, network, stats)) => {
            model.network = network;
            (epoch, stats)
        }
        // Validation loss was never finite: keep the last weights
        None => {
            let last = history.last().map(|m| m.validation);
            let fallback = PairStats {
                loss: f32::NAN,
                accuracy: 0.0,
                pairs: validation_pairs.len(),
            };
            (history.len(), last.unwrap_or(fallback))
        }
    };

    let summary = TrainingSummary {
        epochs_run: history.len(),
        best_epoch,
        best_validation_loss: best_validation.loss,
        best_validation_accuracy: best_validation.accuracy,
        final_learning_rate: trainer.learning_rate(),
        margin: config.margin,
        stopped_early,
        train_pairs: train_pairs.len(),
        validation_pairs: validation_pairs.len(),
        seed: config.seed,
    };
    tracing::info!(
        best_epoch,
        best_val_loss = summary.best_validation_loss,
        best_val_accuracy = summary.best_validation_accuracy,
        "training finished"
    );
    model.set_training_summary(summary.clone());

    Ok(TrainingReport { history, summary })
}
