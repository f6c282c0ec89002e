// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use super::{check_width, fixed_point, sign_and_safe_magnitude};
use crate::error::{OverrideError, OverrideResult};
use crate::ops;
use crate::overrider::{Scope, Transform};
use crate::report::Entries;
use crate::value::Value;

/// Logarithmic quantizer: the exponent `log_base |x|` is stored as a signed
/// fixed-point number, the result is `sign(x) * base^q`.
#[derive(Debug, Clone)]
pub struct LogQuantizer {
    width: u32,
    point: i32,
    base: f64,
}

impl LogQuantizer {
    pub fn new(width: u32, point: i32, base: f64) -> OverrideResult<Self> {
        check_width("LogQuantizer", "width", width)?;
        if !(base > 1.0 && base.is_finite()) {
            return Err(OverrideError::config(format!(
                "LogQuantizer: base must be greater than 1, got {base}"
            )));
        }
        Ok(Self { width, point, base })
    }
}

impl Transform for LogQuantizer {
    fn kind(&self) -> &'static str {
        "LogQuantizer"
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let (sign, magnitude) = sign_and_safe_magnitude(value)?;
        let exponent = ops::log(&magnitude, self.base)?;
        let exponent = fixed_point(
            &exponent,
            self.width,
            &Value::Constant(self.point as f64),
            None,
        )?;
        let power = ops::pow(&Value::Constant(self.base), &exponent)?;
        let forward = ops::mul(&sign, &power)?;
        ops::straight_through(&ops::stop_gradient(&forward)?, value)
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        Ok(Entries::new()
            .with("width", self.width as f64)
            .with("point", self.point as f64)
            .with("base", self.base)
            .finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::overrider::{Overrider, Overriding};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn exponents_are_fixed_point_quantized() {
        // One fractional exponent bit, exponents in [-4, 3.5].
        let mut q = Overriding::new("log", LogQuantizer::new(4, 3, 2.0).unwrap());
        let x = Value::from(array![2.0f32, 3.0, -0.01, 0.0].into_dyn());
        let y = q.apply(&x).unwrap().evaluate().unwrap();
        assert_abs_diff_eq!(y[[0]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[1]], 2f32.powf(1.5), epsilon = 1e-5);
        assert_abs_diff_eq!(y[[2]], -0.0625, epsilon = 1e-7);
        assert_eq!(y[[3]], 0.0);
    }

    #[test]
    fn gradient_is_straight_through() {
        let graph = Graph::new();
        let w = graph.variable("w", array![0.7f32, -1.9].into_dyn(), true);
        let mut q = Overriding::new("log", LogQuantizer::new(5, 3, 2.0).unwrap());
        let out = q.apply(&Value::from(w.clone())).unwrap();
        let grads = graph.gradients(out.as_tensor().unwrap(), &[&w]).unwrap();
        assert!(grads[0].iter().all(|&g| g == 1.0));
    }

    #[test]
    fn base_must_exceed_one() {
        assert!(LogQuantizer::new(4, 2, 1.0).is_err());
    }
}
