// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use spiral_override::lra::factorize;
use spiral_override::ops::RoundingMode;
use spiral_override::{
    build_overrider, ops, Domain, DynamicNetworkSurgeryPruner, FixedPointQuantizer, Graph,
    IncrementalQuantizer, MeanStdPruner, OverrideError, OverrideResult, Overrider,
    OverriderConfig, Overriding, Point, SelectionPolicy, Value,
};

fn normal(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array::from_shape_simple_fn(IxDyn(shape), || rng.sample(StandardNormal))
}

fn quantize(config: &str, values: &ArrayD<f32>) -> ArrayD<f32> {
    let config = OverriderConfig::from_json(config).unwrap();
    let mut overrider = build_overrider("w", &config, Some(1)).unwrap();
    overrider
        .apply(&Value::Array(values.clone()))
        .unwrap()
        .evaluate()
        .unwrap()
}

#[test]
fn quantizers_are_idempotent() {
    let values = normal(&[8, 16], 11);
    let configs = [
        r#"{ "type": "FixedPointQuantizer", "width": 8, "point": 3 }"#,
        r#"{ "type": "FloatingPointQuantizer", "exponent_width": 5, "mantissa_width": 2 }"#,
        r#"{ "type": "ShiftQuantizer", "width": 4 }"#,
        r#"{ "type": "LogQuantizer", "width": 6, "point": 3 }"#,
    ];
    for config in configs {
        let once = quantize(config, &values);
        let twice = quantize(config, &once);
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }
}

#[test]
fn stochastic_fixed_point_keeps_representable_values() {
    // width 8, point 3: step 1/32 within [-4, 4 - 1/32].
    let representable = array![0.5f32, -1.25, 1.0, 0.0, 3.96875, -4.0].into_dyn();
    let grid = quantize(
        r#"{ "type": "FixedPointQuantizer", "width": 8, "point": 3 }"#,
        &normal(&[64], 13),
    );
    for mode in ["naive", "ulp"] {
        let config = format!(
            r#"{{ "type": "FixedPointQuantizer", "width": 8, "point": 3, "stochastic": "{mode}" }}"#
        );
        for _ in 0..20 {
            assert_eq!(quantize(&config, &representable), representable, "{mode}");
        }
        assert_eq!(quantize(&config, &grid), grid, "{mode}");
    }
}

#[test]
fn reconstruction_error_shrinks_with_rank() {
    let values = normal(&[64, 64], 5);
    let mut previous = f64::INFINITY;
    for rank in [1, 4, 16, 32, 64] {
        let factors = factorize(&values, rank).unwrap();
        let rebuilt = factors.left.dot(&factors.right).into_dyn();
        let error = (&rebuilt - &values)
            .iter()
            .map(|d| (*d as f64).powi(2))
            .sum::<f64>()
            .sqrt();
        assert!(error < previous, "rank {rank}: {error} >= {previous}");
        previous = error;
    }
    assert!(previous < 1e-3, "full rank error {previous}");
}

#[test]
fn mean_std_assign_zeroes_small_weights() {
    let values = normal(&[100], 21);
    let magnitudes: Vec<f64> = values.iter().map(|v| (*v as f64).abs()).collect();
    let mean = magnitudes.iter().sum::<f64>() / 100.0;
    let std = (magnitudes.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / 100.0).sqrt();
    let threshold = mean + 0.5 * std;

    let graph = Graph::new();
    let w = graph.variable("w", values.clone(), true);
    let mut overrider = Overriding::new("w", MeanStdPruner::new(0.5, 0.0).unwrap());
    overrider.apply(&Value::Symbolic(w.clone())).unwrap();
    overrider.assign().unwrap();

    let assigned = w.eval().unwrap();
    for (original, pruned) in values.iter().zip(assigned.iter()) {
        if ((*original as f64).abs()) < threshold {
            assert_eq!(*pruned, 0.0);
        } else {
            assert_eq!(pruned, original);
        }
    }
}

#[test]
fn elementwise_rounding_agrees_across_domains() {
    let values = array![-2.5f32, -1.2, 0.0, 0.49, 1.5, 3.7].into_dyn();
    let graph = Graph::new();
    let array = Value::Array(values.clone());
    let symbolic = Value::Symbolic(graph.constant(values.clone()));
    let lo = Value::Constant(-1.0);
    let hi = Value::Constant(2.0);

    let unary: [fn(&Value) -> OverrideResult<Value>; 4] =
        [ops::floor, ops::ceil, ops::round, ops::abs];
    for op in unary {
        let eager = op(&array).unwrap().evaluate().unwrap();
        let deferred = op(&symbolic).unwrap().evaluate().unwrap();
        for (index, (a, b)) in eager.iter().zip(deferred.iter()).enumerate() {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
            let scalar = op(&Value::Constant(values[index] as f64))
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_abs_diff_eq!(*a as f64, scalar, epsilon = 1e-6);
        }
    }

    let positive = ops::abs(&array).unwrap();
    let eager = ops::sqrt(&positive).unwrap().evaluate().unwrap();
    let deferred = ops::sqrt(&ops::abs(&symbolic).unwrap()).unwrap().evaluate().unwrap();
    assert_eq!(eager, deferred);

    let eager = ops::clip_by_value(&array, &lo, &hi, true).unwrap();
    let deferred = ops::clip_by_value(&symbolic, &lo, &hi, true).unwrap();
    assert_eq!(eager.evaluate().unwrap(), deferred.evaluate().unwrap());
    assert_eq!(
        eager.evaluate().unwrap(),
        array![-1.0f32, -1.0, 0.0, 0.49, 1.5, 2.0].into_dyn()
    );
}

#[test]
fn ulp_rounding_rate_tracks_the_fraction() {
    let mut rng = StdRng::seed_from_u64(2024);
    let trials = ArrayD::from_elem(IxDyn(&[10_000]), 4.3f32);
    let rounded = ops::stochastic_round(&Value::Array(trials), RoundingMode::Ulp, &mut rng)
        .unwrap()
        .evaluate()
        .unwrap();
    assert!(rounded.iter().all(|v| *v == 4.0 || *v == 5.0));
    let up = rounded.iter().filter(|v| **v == 5.0).count() as f64 / 10_000.0;
    assert!((up - 0.3).abs() < 0.05, "rounded up {up}");
}

#[test]
fn surgery_revives_weights_that_grow_back() {
    let graph = Graph::new();
    let w = graph.variable("w", array![0.1f32, 1.0, 2.0, 3.0].into_dyn(), true);
    let pruner = DynamicNetworkSurgeryPruner::with_factors(0.0, 0.0, 1.1, 0.9).unwrap();
    let mut overrider = Overriding::new("w", pruner);
    let after = overrider.apply(&Value::Symbolic(w.clone())).unwrap();
    let after = after.as_tensor().unwrap().clone();

    overrider.update().unwrap();
    assert_eq!(after.eval().unwrap(), array![0.0f32, 0.0, 2.0, 3.0].into_dyn());

    // The first weight regrows past the splice threshold, the third decays
    // below the prune threshold.
    graph
        .assign(&w, array![5.0f32, 1.0, 2.0, 3.0].into_dyn())
        .unwrap();
    overrider.update().unwrap();
    assert_eq!(after.eval().unwrap(), array![5.0f32, 0.0, 0.0, 3.0].into_dyn());

    // Pruned weights still receive gradients.
    let loss = ops::sum(&Value::Symbolic(after), None, false).unwrap();
    let grads = graph
        .gradients(loss.as_tensor().unwrap(), &[&w])
        .unwrap();
    assert_eq!(grads[0], ArrayD::<f32>::ones(IxDyn(&[4])));
}

#[test]
fn chain_applies_children_in_declaration_order() {
    let values = normal(&[32], 3);
    let chain = r#"{
        "type": "ChainOverrider",
        "overriders": [
            { "type": "FixedPointQuantizer", "width": 6, "point": 2 },
            { "type": "ShiftQuantizer", "width": 4 }
        ]
    }"#;
    let config = OverriderConfig::from_json(chain).unwrap();
    let mut overrider = build_overrider("w", &config, None).unwrap();
    let chained = overrider
        .apply(&Value::Array(values.clone()))
        .unwrap()
        .evaluate()
        .unwrap();

    let first = quantize(r#"{ "type": "FixedPointQuantizer", "width": 6, "point": 2 }"#, &values);
    let manual = quantize(r#"{ "type": "ShiftQuantizer", "width": 4 }"#, &first);
    assert_eq!(chained, manual);

    let names: Vec<String> = overrider
        .report()
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["w/0", "w/1"]);
}

#[test]
fn operands_promote_to_the_widest_domain() {
    let graph = Graph::new();
    let constant = Value::Constant(2.0);
    let array = Value::Array(array![1.0f32, -1.0].into_dyn());
    let tensor = Value::Symbolic(graph.constant(array![0.5f32, 0.5].into_dyn()));

    assert_eq!(ops::add(&constant, &constant).unwrap().domain(), Domain::Constant);
    let mixed = ops::mul(&constant, &array).unwrap();
    assert_eq!(mixed.domain(), Domain::ImmediateArray);
    assert_eq!(mixed.evaluate().unwrap(), array![2.0f32, -2.0].into_dyn());

    let symbolic = ops::add(&array, &tensor).unwrap();
    assert_eq!(symbolic.domain(), Domain::SymbolicTensor);
    assert_eq!(symbolic.evaluate().unwrap(), array![1.5f32, -0.5].into_dyn());

    assert!(matches!(
        ops::logical_not(&constant),
        Err(OverrideError::DomainMismatch { .. })
    ));
}

#[test]
fn rounding_is_transparent_to_gradients() {
    let graph = Graph::new();
    let w = graph.variable("w", array![0.2f32, 1.7, -3.4].into_dyn(), true);
    let weights = Value::Symbolic(w.clone());

    let rounded = ops::round(&weights).unwrap();
    let loss = ops::sum(&rounded, None, false).unwrap();
    let grads = graph.gradients(loss.as_tensor().unwrap(), &[&w]).unwrap();
    assert_eq!(grads[0], ArrayD::<f32>::ones(IxDyn(&[3])));

    // Opaque clipping blocks the gradient outside the range.
    let clipped = ops::clip_by_value(
        &weights,
        &Value::Constant(-1.0),
        &Value::Constant(1.0),
        false,
    )
    .unwrap();
    let loss = ops::sum(&clipped, None, false).unwrap();
    let grads = graph.gradients(loss.as_tensor().unwrap(), &[&w]).unwrap();
    assert_eq!(grads[0], array![1.0f32, 0.0, 0.0].into_dyn());

    let mut quantizer = Overriding::new("w", FixedPointQuantizer::new(4, Point::Fixed(2)).unwrap());
    let after = quantizer.apply(&weights).unwrap();
    let loss = ops::sum(&after, None, false).unwrap();
    let grads = graph.gradients(loss.as_tensor().unwrap(), &[&w]).unwrap();
    assert_eq!(grads[0], ArrayD::<f32>::ones(IxDyn(&[3])));
}

#[test]
fn malformed_configurations_are_rejected() {
    let cases = [
        r#"{ "type": "TernaryQuantizer" }"#,
        r#"{ "type": "FixedPointQuantizer", "width": 8, "point": 2, "signed": true }"#,
        r#"{ "type": "FixedPointQuantizer", "width": 8 }"#,
        r#"{ "type": "FixedPointQuantizer", "width": 0, "point": 0 }"#,
        r#"{ "type": "IncrementalQuantizer", "quantizer": { "type": "EmptyOverrider" }, "interval": 1.5 }"#,
        r#"{ "type": "LowRankApproximation", "rank": 0 }"#,
        r#"{ "type": "ChainOverrider", "overriders": [ { "type": "ChainOverrider", "overriders": [] } ] }"#,
    ];
    for case in cases {
        let built = OverriderConfig::from_json(case)
            .and_then(|config| build_overrider("w", &config, None).map(|_| ()));
        assert!(
            matches!(built, Err(OverrideError::Configuration { .. })),
            "{case} was accepted"
        );
    }
}

#[test]
fn incremental_quantization_freezes_everything_on_schedule() {
    let values = normal(&[20], 7);
    let inner = FixedPointQuantizer::new(4, Point::Fixed(2)).unwrap();
    let incremental =
        IncrementalQuantizer::new(Box::new(inner), 0.3, SelectionPolicy::Largest, true).unwrap();
    let mut overrider = Overriding::new("w", incremental);
    let before = Value::Array(values.clone());
    overrider.apply(&before).unwrap();
    assert_eq!(overrider.transform().frozen_fraction(&values).unwrap(), 0.0);

    let mut previous = 0.0;
    for update in 1..=4 {
        overrider.update().unwrap();
        let frozen = overrider.transform().frozen_fraction(&values).unwrap();
        let target = (update as f64 * 0.3).min(1.0);
        assert!(frozen >= previous, "update {update}: {frozen} < {previous}");
        assert!(
            frozen >= target - 1e-9 && frozen <= target + 0.05 + 1e-9,
            "update {update}: frozen {frozen}, target {target}"
        );
        previous = frozen;
    }
    assert_abs_diff_eq!(
        overrider.transform().frozen_fraction(&values).unwrap(),
        1.0,
        epsilon = 1e-9
    );
    let full = quantize(r#"{ "type": "FixedPointQuantizer", "width": 4, "point": 2 }"#, &values);
    assert_eq!(overrider.after().unwrap().evaluate().unwrap(), full);
}
