// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;

use super::{check_width, choose, sign_and_safe_magnitude};
use crate::error::{OverrideError, OverrideResult};
use crate::ops;
use crate::overrider::{Scope, Transform};
use crate::report::{density, Entries};
use crate::value::Value;

/// Reduced-precision floating point: `exponent_width` exponent bits with
/// `exponent_bias`, `mantissa_width` explicit mantissa bits. Values below the
/// smallest normal exponent keep that exponent and lose mantissa precision.
#[derive(Debug, Clone)]
pub struct FloatingPointQuantizer {
    exponent_width: u32,
    mantissa_width: u32,
    exponent_bias: i32,
}

impl FloatingPointQuantizer {
    pub fn new(
        exponent_width: u32,
        mantissa_width: u32,
        exponent_bias: Option<i32>,
    ) -> OverrideResult<Self> {
        check_width("FloatingPointQuantizer", "exponent_width", exponent_width)?;
        if mantissa_width > 23 {
            return Err(OverrideError::config(format!(
                "FloatingPointQuantizer: mantissa_width must be at most 23, got {mantissa_width}"
            )));
        }
        if !(2..=8).contains(&exponent_width) {
            return Err(OverrideError::config(format!(
                "FloatingPointQuantizer: exponent_width must be within 2..=8, got {exponent_width}"
            )));
        }
        let bias = exponent_bias.unwrap_or((1 << (exponent_width - 1)) - 1);
        Ok(Self {
            exponent_width,
            mantissa_width,
            exponent_bias: bias,
        })
    }

    /// Smallest and largest unbiased exponents of normal numbers.
    pub fn exponent_range(&self) -> (f64, f64) {
        let max_code = (1i64 << self.exponent_width) - 2;
        (
            1.0 - self.exponent_bias as f64,
            (max_code - self.exponent_bias as i64) as f64,
        )
    }

    /// Largest representable magnitude.
    pub fn max_value(&self) -> f64 {
        let (_, emax) = self.exponent_range();
        (2.0 - (-(self.mantissa_width as f64)).exp2()) * emax.exp2()
    }
}

impl Transform for FloatingPointQuantizer {
    fn kind(&self) -> &'static str {
        "FloatingPointQuantizer"
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let (sign, magnitude) = sign_and_safe_magnitude(value)?;
        let (emin, emax) = self.exponent_range();
        let exponent = ops::floor(&ops::log(&magnitude, 2.0)?)?;
        let exponent = ops::clip_by_value(
            &exponent,
            &Value::Constant(emin),
            &Value::Constant(emax),
            true,
        )?;
        let scale = ops::exp2(&exponent)?;
        let steps = Value::Constant((self.mantissa_width as f64).exp2());
        let mantissa = ops::div(&magnitude, &scale)?;
        let mantissa = ops::div(&ops::round(&ops::mul(&mantissa, &steps)?)?, &steps)?;
        let quantized = ops::minimum(
            &ops::mul(&mantissa, &scale)?,
            &Value::Constant(self.max_value()),
        )?;
        let forward = ops::mul(&sign, &quantized)?;
        ops::straight_through(&ops::stop_gradient(&forward)?, value)
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        Ok(Entries::new()
            .with("exponent_width", self.exponent_width as f64)
            .with("mantissa_width", self.mantissa_width as f64)
            .with("exponent_bias", self.exponent_bias as f64)
            .finish())
    }
}

/// Power-of-two quantizer: a sign bit and `width - 1` bits of exponent.
/// Exponents are rounded in the log domain, flushed to zero below the range
/// and saturated above it.
#[derive(Debug, Clone)]
pub struct ShiftQuantizer {
    width: u32,
    bias: i32,
}

impl ShiftQuantizer {
    pub fn new(width: u32, bias: Option<i32>) -> OverrideResult<Self> {
        check_width("ShiftQuantizer", "width", width)?;
        if width < 2 {
            return Err(OverrideError::config(
                "ShiftQuantizer: width must leave at least one exponent bit",
            ));
        }
        let codes = 1i64 << (width - 1);
        Ok(Self {
            width,
            bias: bias.unwrap_or((codes - 1) as i32),
        })
    }

    /// Smallest and largest representable exponents.
    pub fn exponent_range(&self) -> (f64, f64) {
        let codes = (1i64 << (self.width - 1)) as f64;
        let bias = self.bias as f64;
        (-bias, codes - 1.0 - bias)
    }
}

impl Transform for ShiftQuantizer {
    fn kind(&self) -> &'static str {
        "ShiftQuantizer"
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        let (sign, magnitude) = sign_and_safe_magnitude(value)?;
        let (emin, emax) = self.exponent_range();
        let exponent = ops::round(&ops::log(&magnitude, 2.0)?)?;
        let underflow = ops::less(&exponent, &Value::Constant(emin))?;
        let exponent = ops::minimum(&exponent, &Value::Constant(emax))?;
        let shifted = ops::mul(&sign, &ops::exp2(&exponent)?)?;
        let forward = choose(&underflow, &Value::Constant(0.0), &shifted)?;
        ops::straight_through(&ops::stop_gradient(&forward)?, value)
    }

    fn report(&self, _before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        Ok(Entries::new()
            .with("width", self.width as f64)
            .with("bias", self.bias as f64)
            .with("density", density(&after.evaluate()?))
            .finish())
    }
}
