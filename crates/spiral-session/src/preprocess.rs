// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Batching contract between an image pipeline and the session drivers.
//!
//! Decoding and augmentation live outside this crate. What stays here is the
//! shape bookkeeping: every batch is `[batch, height, width, channels]`, the
//! effective batch size spans all devices and each batch is split into one
//! shard per device along axis 0.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use spiral_config::SystemConfig;
use tracing::debug;

use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Validate,
    Test,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Validate => "validate",
            Mode::Test => "test",
        }
    }

    /// Train and validate batches are always full; a short final batch is
    /// discarded.
    pub fn drops_remainder(self) -> bool {
        !matches!(self, Mode::Test)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "validate" => Ok(Mode::Validate),
            "test" => Ok(Mode::Test),
            other => Err(SessionError::UnknownMode(other.to_string())),
        }
    }
}

/// Named augmentation steps per mode. The names are opaque here; the image
/// pipeline interprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Actions {
    pub train: Vec<String>,
    pub validate: Vec<String>,
    pub test: Vec<String>,
    pub final_cpu: Vec<String>,
    pub final_gpu: Vec<String>,
}

impl Actions {
    pub fn for_mode(&self, mode: Mode) -> &[String] {
        match mode {
            Mode::Train => &self.train,
            Mode::Validate => &self.validate,
            Mode::Test => &self.test,
        }
    }
}

/// Named images in NHWC layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub names: Vec<String>,
    pub images: Array4<f32>,
}

impl Batch {
    pub fn new(names: Vec<String>, images: Array4<f32>) -> SessionResult<Self> {
        if names.len() != images.len_of(Axis(0)) {
            return Err(SessionError::BatchShape {
                expected: vec![names.len()],
                got: images.shape().to_vec(),
            });
        }
        Ok(Self { names, images })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Producer of batches, typically the decoding and augmentation pipeline.
pub trait BatchSource {
    /// Next batch, or `None` once the source is exhausted.
    fn next_batch(&mut self) -> SessionResult<Option<Batch>>;
}

/// Batches already held in memory.
#[derive(Debug, Default)]
pub struct InMemorySource {
    batches: VecDeque<Batch>,
}

impl InMemorySource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl BatchSource for InMemorySource {
    fn next_batch(&mut self) -> SessionResult<Option<Batch>> {
        Ok(self.batches.pop_front())
    }
}

#[derive(Debug, Clone)]
pub struct Preprocess {
    mode: Mode,
    after_shape: [usize; 3],
    actions: Actions,
    batch_size_per_gpu: usize,
    num_gpus: usize,
    num_threads: usize,
}

impl Preprocess {
    /// `after_shape` is `[height, width, channels]` after augmentation.
    pub fn new(
        system: &SystemConfig,
        mode: Mode,
        after_shape: [usize; 3],
        actions: Actions,
    ) -> SessionResult<Self> {
        system.validate()?;
        if after_shape.contains(&0) {
            return Err(SessionError::Setup(format!(
                "image shape {after_shape:?} has an empty dimension"
            )));
        }
        Ok(Self {
            mode,
            after_shape,
            actions,
            batch_size_per_gpu: system.batch_size_per_gpu,
            num_gpus: system.num_gpus,
            num_threads: system.preprocess.num_threads,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn after_shape(&self) -> [usize; 3] {
        self.after_shape
    }

    /// Host-side steps in order: the mode's actions, then `final_cpu`.
    pub fn actions(&self) -> Vec<&str> {
        self.actions
            .for_mode(self.mode)
            .iter()
            .chain(self.actions.final_cpu.iter())
            .map(String::as_str)
            .collect()
    }

    /// Steps run on each device shard after the split.
    pub fn device_actions(&self) -> &[String] {
        &self.actions.final_gpu
    }

    pub fn num_gpus(&self) -> usize {
        self.num_gpus
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size_per_gpu * self.num_gpus
    }

    /// Number of images buffered ahead of the consumer.
    pub fn prefetch(&self) -> usize {
        self.num_threads * self.batch_size()
    }

    pub fn batch_shape(&self) -> [usize; 4] {
        let [height, width, channels] = self.after_shape;
        [self.batch_size(), height, width, channels]
    }

    /// Accepts full batches in every mode and short ones in test mode.
    pub fn check(&self, batch: &Batch) -> SessionResult<()> {
        let shape = batch.images.shape();
        let full = self.batch_shape();
        let size = shape[0];
        let size_ok = if self.mode.drops_remainder() {
            size == full[0]
        } else {
            (1..=full[0]).contains(&size)
        };
        if !size_ok || shape[1..] != full[1..] {
            return Err(SessionError::BatchShape {
                expected: full.to_vec(),
                got: shape.to_vec(),
            });
        }
        Ok(())
    }

    /// Splits a batch into per-device shards along axis 0. A short test
    /// batch yields fewer or smaller shards; empty shards are omitted.
    pub fn split(&self, batch: &Batch) -> SessionResult<Vec<Batch>> {
        self.check(batch)?;
        let shard = batch.len().div_ceil(self.num_gpus);
        let shards = batch
            .images
            .axis_chunks_iter(Axis(0), shard)
            .zip(batch.names.chunks(shard))
            .map(|(images, names)| Batch {
                names: names.to_vec(),
                images: images.to_owned(),
            })
            .collect::<Vec<_>>();
        debug!(
            mode = %self.mode,
            batch = batch.len(),
            shards = shards.len(),
            "split batch across devices"
        );
        Ok(shards)
    }

    /// Groups individual `[height, width, channels]` images into batches of
    /// [`Self::batch_size`], dropping a short tail unless in test mode.
    pub fn batches(&self, samples: Vec<(String, Array3<f32>)>) -> SessionResult<InMemorySource> {
        for (_, image) in &samples {
            if image.shape() != &self.after_shape[..] {
                return Err(SessionError::BatchShape {
                    expected: self.after_shape.to_vec(),
                    got: image.shape().to_vec(),
                });
            }
        }
        let size = self.batch_size();
        let mut batches = Vec::with_capacity(samples.len() / size + 1);
        for group in samples.chunks(size) {
            if group.len() < size && self.mode.drops_remainder() {
                debug!(dropped = group.len(), "dropping short final batch");
                break;
            }
            let views: Vec<ArrayView3<f32>> = group.iter().map(|(_, image)| image.view()).collect();
            let images = ndarray::stack(Axis(0), &views)
                .map_err(|err| SessionError::Setup(err.to_string()))?;
            let names = group.iter().map(|(name, _)| name.clone()).collect();
            batches.push(Batch { names, images });
        }
        Ok(InMemorySource::new(batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(num_gpus: usize, per_gpu: usize) -> SystemConfig {
        SystemConfig {
            num_gpus,
            batch_size_per_gpu: per_gpu,
            ..SystemConfig::default()
        }
    }

    fn samples(count: usize) -> Vec<(String, Array3<f32>)> {
        (0..count)
            .map(|i| (format!("img{i}"), Array3::from_elem((2, 2, 3), i as f32)))
            .collect()
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert_eq!("validate".parse::<Mode>().unwrap(), Mode::Validate);
        assert!(matches!(
            "eval".parse::<Mode>(),
            Err(SessionError::UnknownMode(mode)) if mode == "eval"
        ));
    }

    #[test]
    fn actions_append_final_cpu_steps() {
        let actions = Actions {
            train: vec!["random_crop".into(), "flip".into()],
            test: vec!["central_crop".into()],
            final_cpu: vec!["normalize".into()],
            final_gpu: vec!["cast".into()],
            ..Actions::default()
        };
        let pre = Preprocess::new(&system(1, 2), Mode::Train, [2, 2, 3], actions).unwrap();
        assert_eq!(pre.actions(), vec!["random_crop", "flip", "normalize"]);
        assert_eq!(pre.device_actions(), ["cast".to_string()]);
    }

    #[test]
    fn batch_size_spans_devices() {
        let mut config = system(2, 3);
        config.preprocess.num_threads = 4;
        let pre = Preprocess::new(&config, Mode::Train, [2, 2, 3], Actions::default()).unwrap();
        assert_eq!(pre.batch_size(), 6);
        assert_eq!(pre.prefetch(), 24);
        assert_eq!(pre.batch_shape(), [6, 2, 2, 3]);
    }

    #[test]
    fn train_drops_remainder_and_test_keeps_it() {
        let train = Preprocess::new(&system(1, 4), Mode::Train, [2, 2, 3], Actions::default())
            .unwrap()
            .batches(samples(10))
            .unwrap();
        assert_eq!(train.remaining(), 2);

        let mut test = Preprocess::new(&system(1, 4), Mode::Test, [2, 2, 3], Actions::default())
            .unwrap()
            .batches(samples(10))
            .unwrap();
        assert_eq!(test.remaining(), 3);
        let mut last = None;
        while let Some(batch) = test.next_batch().unwrap() {
            last = Some(batch);
        }
        let last = last.unwrap();
        assert_eq!(last.names, vec!["img8", "img9"]);
        assert_eq!(last.images.shape(), &[2, 2, 2, 3]);
    }

    #[test]
    fn split_shards_along_the_batch_axis() {
        let pre = Preprocess::new(&system(2, 2), Mode::Validate, [2, 2, 3], Actions::default())
            .unwrap();
        let mut source = pre.batches(samples(4)).unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        let shards = pre.split(&batch).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[1].names, vec!["img2", "img3"]);
        assert_eq!(shards[1].images[[0, 0, 0, 0]], 2.0);
    }

    #[test]
    fn check_rejects_wrong_image_shape() {
        let pre = Preprocess::new(&system(1, 2), Mode::Train, [2, 2, 3], Actions::default())
            .unwrap();
        let batch = Batch::new(
            vec!["a".into(), "b".into()],
            Array4::zeros((2, 2, 2, 1)),
        )
        .unwrap();
        assert!(matches!(
            pre.check(&batch),
            Err(SessionError::BatchShape { .. })
        ));
        assert!(Batch::new(vec!["a".into()], Array4::zeros((2, 2, 2, 3))).is_err());
    }
}
