use anyhow::{Context, Result};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::OBS_DIM;
use crate::frame::{Observation, RollingWindow};

/// Per-epoch metrics from one fit call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitHistory {
    pub loss: Vec<f32>,
    pub accuracy: Vec<f32>,
}

/// Decision model consumed by the play loop and the training pipeline.
pub trait Model {
    fn num_classes(&self) -> usize;

    /// Class probabilities for a single window of observations
    fn predict(&self, window: &RollingWindow) -> Result<Vec<f32>>;

    /// Incrementally fit on single-observation samples
    fn fit(
        &mut self,
        observations: &[Observation],
        labels: &[usize],
        batch_size: usize,
        epochs: usize,
    ) -> Result<FitHistory>;

    fn save(&self, path: &Path) -> Result<()>;
}

/// Index and value of the most probable class
pub fn argmax(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

// =============================================================================
// Classifier Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub hidden_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ClassifierMeta {
    num_classes: usize,
    obs_dim: usize,
    config: ClassifierConfig,
}

// =============================================================================
// Network (candle)
// =============================================================================

/// Frame encoder shared across time steps, mean-pooled over the window,
/// followed by a classification head. A single observation is a window of one.
struct ClassifierNet {
    encoder: Linear,
    mix: Linear,
    head: Linear,
    hidden_size: usize,
}

impl ClassifierNet {
    fn new(vs: VarBuilder, hidden_size: usize, num_classes: usize) -> Result<Self> {
        Ok(Self {
            encoder: candle_nn::linear(OBS_DIM, hidden_size, vs.pp("encoder"))?,
            mix: candle_nn::linear(hidden_size, hidden_size, vs.pp("mix"))?,
            head: candle_nn::linear(hidden_size, num_classes, vs.pp("head"))?,
            hidden_size,
        })
    }

    /// (batch, steps, OBS_DIM) → (batch, classes) logits
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, steps, dim) = x.dims3()?;
        let h = self
            .encoder
            .forward(&x.reshape((batch * steps, dim))?)?
            .relu()?;
        let h = h.reshape((batch, steps, self.hidden_size))?.mean(1)?;
        let h = self.mix.forward(&h)?.relu()?;
        self.head.forward(&h)
    }
}

pub struct FrameClassifier {
    varmap: VarMap,
    net: ClassifierNet,
    optimizer: AdamW,
    device: Device,
    num_classes: usize,
    config: ClassifierConfig,
    rng: SmallRng,
}

impl FrameClassifier {
    pub fn new(device: &Device, num_classes: usize, config: ClassifierConfig) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = ClassifierNet::new(vb, config.hidden_size, num_classes)?;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        Ok(Self {
            varmap,
            net,
            optimizer,
            device: device.clone(),
            num_classes,
            config,
            rng: SmallRng::from_os_rng(),
        })
    }

    /// Load saved weights; the shape comes from the metadata written next to them
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let meta_path = meta_path(path);
        let file = File::open(&meta_path)
            .with_context(|| format!("Failed to open model metadata: {}", meta_path.display()))?;
        let meta: ClassifierMeta = serde_json::from_reader(std::io::BufReader::new(file))
            .context("Failed to parse model metadata")?;
        if meta.obs_dim != OBS_DIM {
            anyhow::bail!(
                "model expects {} inputs per observation, this build produces {OBS_DIM}",
                meta.obs_dim
            );
        }
        let mut model = Self::new(device, meta.num_classes, meta.config)?;
        model
            .varmap
            .load(path)
            .with_context(|| format!("Failed to load model weights: {}", path.display()))?;
        tracing::info!(path = %path.display(), classes = meta.num_classes, "model loaded");
        Ok(model)
    }

    /// Resume from `path` if it exists, otherwise start fresh
    pub fn open_or_create(
        path: &Path,
        device: &Device,
        num_classes: usize,
        config: ClassifierConfig,
    ) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no saved model, starting fresh");
            return Self::new(device, num_classes, config);
        }
        let model = Self::load(path, device)?;
        if model.num_classes != num_classes {
            anyhow::bail!(
                "saved model has {} classes but the sprite config defines {num_classes}",
                model.num_classes
            );
        }
        Ok(model)
    }

    fn batch_tensors(
        &self,
        observations: &[Observation],
        labels: &[usize],
        indices: &[usize],
    ) -> Result<(Tensor, Tensor)> {
        let mut xs = Vec::with_capacity(indices.len() * OBS_DIM);
        let mut ys = Vec::with_capacity(indices.len());
        for &i in indices {
            xs.extend(observations[i].normalized());
            ys.push(labels[i] as u32);
        }
        let x = Tensor::from_vec(xs, (indices.len(), 1, OBS_DIM), &self.device)?;
        let y = Tensor::from_vec(ys, indices.len(), &self.device)?;
        Ok((x, y))
    }
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

impl Model for FrameClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, window: &RollingWindow) -> Result<Vec<f32>> {
        let x = Tensor::from_vec(
            window.to_normalized_vec(),
            (1, window.len(), OBS_DIM),
            &self.device,
        )?;
        let logits = self.net.forward(&x)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        Ok(probs.squeeze(0)?.to_vec1::<f32>()?)
    }

    fn fit(
        &mut self,
        observations: &[Observation],
        labels: &[usize],
        batch_size: usize,
        epochs: usize,
    ) -> Result<FitHistory> {
        if observations.len() != labels.len() {
            anyhow::bail!(
                "{} observations but {} labels",
                observations.len(),
                labels.len()
            );
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= self.num_classes) {
            anyhow::bail!("label {bad} out of range for {} classes", self.num_classes);
        }
        let mut history = FitHistory::default();
        if observations.is_empty() {
            return Ok(history);
        }

        let mut order: Vec<usize> = (0..observations.len()).collect();
        let total = observations.len() as f32;
        for _ in 0..epochs {
            order.shuffle(&mut self.rng);
            let mut loss_sum = 0.0f32;
            let mut correct = 0.0f32;
            for chunk in order.chunks(batch_size.max(1)) {
                let (x, y) = self.batch_tensors(observations, labels, chunk)?;
                let logits = self.net.forward(&x)?;
                let loss = candle_nn::loss::cross_entropy(&logits, &y)?;
                self.optimizer.backward_step(&loss)?;

                loss_sum += loss.to_scalar::<f32>()? * chunk.len() as f32;
                correct += logits
                    .argmax(D::Minus1)?
                    .eq(&y)?
                    .to_dtype(DType::F32)?
                    .sum_all()?
                    .to_scalar::<f32>()?;
            }
            history.loss.push(loss_sum / total);
            history.accuracy.push(correct / total);
        }
        Ok(history)
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        self.varmap.save(path)?;
        let meta = ClassifierMeta {
            num_classes: self.num_classes,
            obs_dim: OBS_DIM,
            config: self.config.clone(),
        };
        let file = File::create(meta_path(path))?;
        serde_json::to_writer(std::io::BufWriter::new(file), &meta)?;
        tracing::info!(path = %path.display(), "model saved");
        Ok(())
    }
}
