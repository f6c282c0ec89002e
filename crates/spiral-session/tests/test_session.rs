// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array3, ArrayD, ArrayViewD, IxDyn};
use spiral_config::SystemConfig;
use spiral_override::OverriderConfig;
use spiral_session::{
    Actions, Batch, JsonCheckpoint, Mode, Preprocess, Session, SessionError, SessionResult, Task,
    Test,
};
use tempfile::tempdir;

/// Scores each image as its mean pixel times the sum of the overridden
/// weights.
#[derive(Default)]
struct MeanTimesWeights {
    seen: Vec<(String, f32)>,
}

impl Task for MeanTimesWeights {
    fn predict(&mut self, session: &Session, shard: &Batch) -> SessionResult<ArrayD<f32>> {
        let weights = session.parameter("w")?.eval()?.sum();
        let means: Array1<f32> = shard
            .images
            .outer_iter()
            .map(|image| image.mean().unwrap_or_default() * weights)
            .collect();
        Ok(means.into_dyn())
    }

    fn test(&mut self, names: &[String], predictions: ArrayViewD<'_, f32>) -> SessionResult<()> {
        for (name, score) in names.iter().zip(predictions.iter()) {
            self.seen.push((name.clone(), *score));
        }
        Ok(())
    }
}

fn samples(count: usize) -> Vec<(String, Array3<f32>)> {
    (0..count)
        .map(|i| (format!("img{i}"), Array3::from_elem((2, 2, 1), (i + 1) as f32)))
        .collect()
}

#[test]
fn test_session_restores_checkpoint_and_tests_every_image() {
    let dir = tempdir().unwrap();
    let checkpoint = dir.path().join("model.json");

    // A trained model whose weights are saved after quantization.
    let mut trained = Session::new(SystemConfig::default()).unwrap();
    trained.variable("w", array![0.3f32, 0.7, 0.05].into_dyn(), true);
    let quantizer = OverriderConfig::from_json(
        r#"{ "type": "FixedPointQuantizer", "width": 4, "point": 2 }"#,
    )
    .unwrap();
    trained.override_variable("w", &quantizer).unwrap();
    trained.assign_overriders().unwrap();
    JsonCheckpoint::new()
        .save(&checkpoint, trained.graph())
        .unwrap();

    let mut system = SystemConfig {
        num_gpus: 2,
        batch_size_per_gpu: 2,
        ..SystemConfig::default()
    };
    system.checkpoint.load = Some(checkpoint.clone());
    let session = Session::new(system.clone()).unwrap();
    session.variable("w", ArrayD::zeros(IxDyn(&[3])), true);
    let preprocess = Preprocess::new(&system, Mode::Test, [2, 2, 1], Actions::default()).unwrap();
    let mut source = preprocess.batches(samples(5)).unwrap();

    let mut test = Test::new(
        session,
        preprocess,
        MeanTimesWeights::default(),
        &mut JsonCheckpoint::new(),
    )
    .unwrap();
    assert_eq!(test.test(&mut source).unwrap(), 5);

    // 0.3 -> 0.25, 0.7 -> 0.75, 0.05 -> 0.0
    let seen = &test.task().seen;
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[4].0, "img4");
    assert_abs_diff_eq!(seen[4].1, 5.0, epsilon = 1e-6);
    assert_abs_diff_eq!(seen[0].1, 1.0, epsilon = 1e-6);
}

#[test]
fn test_session_requires_test_preprocessing() {
    let system = SystemConfig::default();
    let session = Session::new(system.clone()).unwrap();
    let preprocess = Preprocess::new(&system, Mode::Train, [2, 2, 1], Actions::default()).unwrap();
    assert!(matches!(
        Test::new(
            session,
            preprocess,
            MeanTimesWeights::default(),
            &mut JsonCheckpoint::new()
        ),
        Err(SessionError::Setup(_))
    ));
}

#[test]
fn pruning_updates_shrink_the_reported_density() {
    let mut session = Session::new(SystemConfig {
        seed: Some(3),
        ..SystemConfig::default()
    })
    .unwrap();
    let weights: Array1<f32> = (0..16).map(|i| i as f32 / 4.0 - 2.0).collect();
    session.variable("w", weights.into_dyn(), true);
    let pruner = OverriderConfig::from_json(
        r#"{ "type": "MeanStdPruner", "multiplier": 0.0, "growth": 0.5 }"#,
    )
    .unwrap();
    session.override_variable("w", &pruner).unwrap();

    let initial = session.reports().unwrap().density();
    session.update_overriders().unwrap();
    session.update_overriders().unwrap();
    let report = session.reports().unwrap();
    assert!(report.density() < initial);
    assert!(report.remaining_params >= 1);
    assert_eq!(report.original_params, 16);
    let entries = &report.overriders[0];
    assert_abs_diff_eq!(entries.get("multiplier").unwrap(), 1.0, epsilon = 1e-9);
}
