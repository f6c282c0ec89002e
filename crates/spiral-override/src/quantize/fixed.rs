// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use tracing::debug;

use super::{check_width, fixed_point, max_abs, overflow_rate};
use crate::error::OverrideResult;
use crate::graph::Tensor;
use crate::ops::RoundingMode;
use crate::overrider::{tensors_of, Scope, StateVariable, Transform};
use crate::report::Entries;
use crate::value::Value;

/// Position of the binary point, counted in integer bits (sign included).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Point {
    Fixed(i32),
    /// Learned jointly with the network. Without an initial value the point
    /// is chosen so that the largest magnitude at build time fits.
    Trainable { initial: Option<i32> },
}

/// Signed fixed-point quantizer with `width` bits, `width - point` of them
/// fractional.
#[derive(Debug, Clone)]
pub struct FixedPointQuantizer {
    width: u32,
    point: Point,
    stochastic: Option<RoundingMode>,
    point_state: Option<StateVariable>,
    rng: Option<StdRng>,
}

impl FixedPointQuantizer {
    pub fn new(width: u32, point: Point) -> OverrideResult<Self> {
        check_width("FixedPointQuantizer", "width", width)?;
        Ok(Self {
            width,
            point,
            stochastic: None,
            point_state: None,
            rng: None,
        })
    }

    /// Rounds stochastically instead of to the nearest code.
    pub fn with_stochastic(mut self, mode: RoundingMode) -> Self {
        self.stochastic = Some(mode);
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    fn point_value(&self) -> Value {
        match (&self.point, &self.point_state) {
            (_, Some(state)) => state.value(),
            (Point::Fixed(p), None) => Value::Constant(*p as f64),
            (Point::Trainable { initial }, None) => {
                Value::Constant(initial.unwrap_or(self.width as i32 / 2) as f64)
            }
        }
    }

    fn current_point(&self) -> OverrideResult<f64> {
        match &self.point_state {
            Some(state) => Ok(state.read()?.iter().next().copied().unwrap_or_default() as f64),
            None => self.point_value().to_scalar(),
        }
    }
}

/// Integer bits needed so that `max_abs` is representable.
fn fitting_point(max_abs: f64) -> i32 {
    if max_abs <= 0.0 {
        return 1;
    }
    max_abs.log2().floor() as i32 + 2
}

impl Transform for FixedPointQuantizer {
    fn kind(&self) -> &'static str {
        "FixedPointQuantizer"
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        if let Point::Trainable { initial } = self.point {
            let initial = match initial {
                Some(point) => point,
                None => fitting_point(max_abs(&before.evaluate()?)),
            };
            debug!(scope = scope.name(), point = initial, "trainable point initialised");
            self.point_state = Some(scope.state(
                "point",
                ArrayD::from_elem(IxDyn(&[]), initial as f32),
                true,
            ));
        }
        if self.stochastic.is_some() {
            self.rng = Some(scope.rng("rounding"));
        }
        Ok(())
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let point = self.point_value();
        let rounding = match (self.stochastic, self.rng.as_mut()) {
            (Some(mode), Some(rng)) => Some((mode, rng)),
            _ => None,
        };
        fixed_point(value, self.width, &point, rounding)
    }

    fn report(&self, before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        let point = self.current_point()?;
        Ok(Entries::new()
            .with("width", self.width as f64)
            .with("point", point)
            .with(
                "overflow_rate",
                overflow_rate(&before.evaluate()?, self.width, point),
            )
            .finish())
    }

    fn reset(&mut self) {
        self.point_state = None;
        self.rng = None;
    }

    fn variables(&self) -> Vec<Tensor> {
        tensors_of(self.point_state.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::overrider::{Overrider, Overriding};
    use ndarray::array;

    #[test]
    fn representable_values_survive_unchanged() {
        let mut q = Overriding::new("q", FixedPointQuantizer::new(8, Point::Fixed(3)).unwrap());
        let x = Value::from(array![0.5f32, -1.25, 3.96875, -4.0].into_dyn());
        let y = q.apply(&x).unwrap();
        assert_eq!(y.evaluate().unwrap(), x.evaluate().unwrap());
    }

    #[test]
    fn trainable_point_is_a_graph_variable_with_gradient() {
        let graph = Graph::new();
        let w = graph.variable("w", array![0.3f32, -1.7, 2.2].into_dyn(), true);
        let mut q = Overriding::new(
            "layer/w",
            FixedPointQuantizer::new(6, Point::Trainable { initial: None }).unwrap(),
        );
        let out = q.apply(&Value::from(w.clone())).unwrap();
        let vars = q.variables();
        assert_eq!(vars.len(), 1);
        assert_eq!(
            graph.variable_name(&vars[0]).as_deref(),
            Some("layer/w/point")
        );
        // max |w| = 2.2 needs 3 integer bits including the sign.
        assert_eq!(vars[0].eval().unwrap().iter().next().copied(), Some(3.0));
        let grads = graph
            .gradients(out.as_tensor().unwrap(), &[&w, &vars[0]])
            .unwrap();
        assert!(grads[0].iter().all(|&g| g == 1.0));
        assert!(grads[1].iter().all(|g| g.is_finite()));
    }

    #[test]
    fn report_includes_overflow_rate() {
        let mut q = Overriding::new("q", FixedPointQuantizer::new(4, Point::Fixed(1)).unwrap());
        q.apply(&Value::from(array![0.25f32, 3.0].into_dyn())).unwrap();
        let report = q.report().unwrap().remove(0);
        assert_eq!(report.get("overflow_rate"), Some(0.5));
        assert_eq!(report.get("width"), Some(4.0));
    }

    #[test]
    fn zero_width_is_rejected() {
        assert!(FixedPointQuantizer::new(0, Point::Fixed(0)).is_err());
    }
}
