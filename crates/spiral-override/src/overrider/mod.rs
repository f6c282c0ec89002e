// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Overrider lifecycle.
//!
//! An [`Overrider`] intercepts a parameter before it is consumed. Variants only
//! describe the numeric transformation by implementing [`Transform`]; the
//! generic [`Overriding`] wrapper owns the binding, caching and write-back
//! logic so every quantizer, pruner and factoriser shares one state machine:
//! `unbuilt -> applied -> updated* -> assigned`.

mod chain;

pub use chain::ChainOverrider;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use ndarray::ArrayD;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::error::{OverrideError, OverrideResult};
use crate::graph::{Graph, Tensor};
use crate::report::OverrideReport;
use crate::value::Value;

/// Stateful unit that overrides a parameter value.
pub trait Overrider {
    fn name(&self) -> &str;

    /// Binds the overrider to `value` and returns the overridden value.
    /// Re-applying the same binding returns the cached result.
    fn apply(&mut self, value: &Value) -> OverrideResult<Value>;

    /// Advances internal state (masks, thresholds, schedules).
    fn update(&mut self) -> OverrideResult<()>;

    /// Writes the overridden value back into the bound parameter.
    fn assign(&mut self) -> OverrideResult<()>;

    /// Drops the binding and all internal state.
    fn reset(&mut self);

    fn before(&self) -> Option<&Value>;

    fn after(&self) -> Option<&Value>;

    fn is_applied(&self) -> bool {
        self.after().is_some()
    }

    fn report(&self) -> OverrideResult<Vec<OverrideReport>>;

    /// Internal state tensors in the symbolic domain.
    fn variables(&self) -> Vec<Tensor>;

    /// Captures everything `update` may change.
    fn save(&self) -> OverrideResult<SavedState>;

    /// Returns to a state captured by [`Overrider::save`] on this overrider.
    fn restore(&mut self, saved: SavedState) -> OverrideResult<()>;
}

/// Opaque overrider state produced by [`Overrider::save`].
pub struct SavedState(Box<dyn Any>);

impl fmt::Debug for SavedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SavedState")
    }
}

impl SavedState {
    pub(crate) fn new<S: Any>(state: S) -> Self {
        Self(Box::new(state))
    }

    pub(crate) fn into_inner<S: Any>(self, name: &str) -> OverrideResult<S> {
        self.0.downcast::<S>().map(|state| *state).map_err(|_| {
            OverrideError::invalid("restore", format!("state was not saved by {name}"))
        })
    }
}

/// Current storage of graph state variables.
pub(crate) fn read_tensors(tensors: Vec<Tensor>) -> OverrideResult<Vec<(Tensor, ArrayD<f32>)>> {
    tensors
        .into_iter()
        .map(|tensor| {
            let value = tensor.eval()?;
            Ok((tensor, value))
        })
        .collect()
}

pub(crate) fn write_tensors(stored: Vec<(Tensor, ArrayD<f32>)>) -> OverrideResult<()> {
    for (tensor, value) in stored {
        tensor.graph().assign(&tensor, value)?;
    }
    Ok(())
}

/// Numeric core of an overrider variant. Variants are `Clone` so a failed
/// update can be rolled back.
pub trait Transform: BoxedTransform {
    fn kind(&self) -> &'static str;

    /// Creates internal state on first binding.
    fn build(&mut self, _scope: &Scope, _before: &Value) -> OverrideResult<()> {
        Ok(())
    }

    fn transform(&mut self, scope: &Scope, value: &Value) -> OverrideResult<Value>;

    fn update(&mut self, _scope: &Scope, _before: &Value) -> OverrideResult<()> {
        Ok(())
    }

    fn report(&self, _before: &Value, _after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        Ok(BTreeMap::new())
    }

    fn reset(&mut self) {}

    fn variables(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Object-safe cloning of transforms.
pub trait BoxedTransform {
    fn clone_box(&self) -> Box<dyn Transform>;
}

impl<T: Transform + Clone + 'static> BoxedTransform for T {
    fn clone_box(&self) -> Box<dyn Transform> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Transform> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

impl Transform for Box<dyn Transform> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn build(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        (**self).build(scope, before)
    }

    fn transform(&mut self, scope: &Scope, value: &Value) -> OverrideResult<Value> {
        (**self).transform(scope, value)
    }

    fn update(&mut self, scope: &Scope, before: &Value) -> OverrideResult<()> {
        (**self).update(scope, before)
    }

    fn report(&self, before: &Value, after: &Value) -> OverrideResult<BTreeMap<String, f64>> {
        (**self).report(before, after)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn variables(&self) -> Vec<Tensor> {
        (**self).variables()
    }
}

/// Naming and domain context handed to a [`Transform`].
#[derive(Debug, Clone)]
pub struct Scope {
    name: String,
    graph: Option<Graph>,
    seed: Option<u64>,
}

impl Scope {
    pub fn new(name: impl Into<String>, graph: Option<Graph>, seed: Option<u64>) -> Self {
        Self {
            name: name.into(),
            graph,
            seed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    /// Scope for a nested transform.
    pub fn child(&self, local: &str) -> Scope {
        Scope {
            name: format!("{}/{}", self.name, local),
            graph: self.graph.clone(),
            seed: self.seed,
        }
    }

    /// Creates a state variable in the bound domain.
    pub fn state(&self, local: &str, init: ArrayD<f32>, trainable: bool) -> StateVariable {
        let name = format!("{}/{}", self.name, local);
        match &self.graph {
            Some(graph) => StateVariable::Symbolic(graph.variable(name, init, trainable)),
            None => StateVariable::Array { name, value: init },
        }
    }

    pub fn rng(&self, local: &str) -> StdRng {
        spiral_config::determinism::rng_for(&format!("{}/{}", self.name, local), self.seed)
    }
}

/// Internal state owned by an overrider: a plain array in the immediate
/// domain, a graph variable in the symbolic one.
#[derive(Debug, Clone)]
pub enum StateVariable {
    Array { name: String, value: ArrayD<f32> },
    Symbolic(Tensor),
}

impl StateVariable {
    pub fn name(&self) -> String {
        match self {
            StateVariable::Array { name, .. } => name.clone(),
            StateVariable::Symbolic(tensor) => tensor
                .graph()
                .variable_name(tensor)
                .unwrap_or_else(|| format!("#{}", tensor.id())),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            StateVariable::Array { value, .. } => value.shape().to_vec(),
            StateVariable::Symbolic(tensor) => tensor.shape().to_vec(),
        }
    }

    /// The variable as an operand.
    pub fn value(&self) -> Value {
        match self {
            StateVariable::Array { value, .. } => Value::Array(value.clone()),
            StateVariable::Symbolic(tensor) => Value::Symbolic(tensor.clone()),
        }
    }

    pub fn read(&self) -> OverrideResult<ArrayD<f32>> {
        match self {
            StateVariable::Array { value, .. } => Ok(value.clone()),
            StateVariable::Symbolic(tensor) => tensor.eval(),
        }
    }

    pub fn write(&mut self, next: ArrayD<f32>) -> OverrideResult<()> {
        match self {
            StateVariable::Array { value, .. } => {
                if value.shape() != next.shape() {
                    return Err(OverrideError::shape("assign", value.shape(), next.shape()));
                }
                *value = next;
                Ok(())
            }
            StateVariable::Symbolic(tensor) => tensor.graph().assign(tensor, next),
        }
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            StateVariable::Symbolic(tensor) => Some(tensor),
            StateVariable::Array { .. } => None,
        }
    }
}

/// Collects the graph variables among `states`.
pub(crate) fn tensors_of<'a>(states: impl IntoIterator<Item = &'a StateVariable>) -> Vec<Tensor> {
    states
        .into_iter()
        .filter_map(|state| state.tensor().cloned())
        .collect()
}

/// Writes `after` into the parameter behind `before`. Returns the new
/// immediate parameter value, or `None` when a graph variable was assigned.
pub(crate) fn write_back(before: &Value, after: &Value) -> OverrideResult<Option<Value>> {
    match before {
        Value::Symbolic(tensor) => {
            if !tensor.is_variable() {
                return Err(OverrideError::NotVariable { id: tensor.id() });
            }
            tensor.graph().assign(tensor, after.evaluate()?)?;
            Ok(None)
        }
        Value::Array(array) => {
            let next = after.evaluate()?;
            if next.shape() != array.shape() {
                return Err(OverrideError::shape("assign", array.shape(), next.shape()));
            }
            Ok(Some(Value::Array(next)))
        }
        Value::Constant(_) => Ok(Some(Value::Constant(after.to_scalar()?))),
    }
}

struct Saved<T> {
    transform: T,
    tensors: Vec<(Tensor, ArrayD<f32>)>,
    before: Option<Value>,
    after: Option<Value>,
}

/// Binds a [`Transform`] to a parameter and drives its lifecycle.
pub struct Overriding<T> {
    name: String,
    transform: T,
    seed: Option<u64>,
    before: Option<Value>,
    after: Option<Value>,
}

impl<T: Transform> fmt::Debug for Overriding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overriding")
            .field("name", &self.name)
            .field("kind", &self.transform.kind())
            .field("applied", &self.after.is_some())
            .finish()
    }
}

impl<T: Transform> Overriding<T> {
    pub fn new(name: impl Into<String>, transform: T) -> Self {
        Self {
            name: name.into(),
            transform,
            seed: None,
            before: None,
            after: None,
        }
    }

    /// Fixes the seed of every random stream drawn by this overrider.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    fn scope(&self, before: &Value) -> Scope {
        Scope::new(self.name.clone(), before.graph().cloned(), self.seed)
    }

    fn bound(&self) -> OverrideResult<&Value> {
        self.before.as_ref().ok_or_else(|| OverrideError::NotApplied {
            name: self.name.clone(),
        })
    }
}

impl<T: Transform + Clone + 'static> Overrider for Overriding<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, value: &Value) -> OverrideResult<Value> {
        if let (Some(before), Some(after)) = (&self.before, &self.after) {
            if before.same_binding(value) {
                return Ok(after.clone());
            }
            if before.is_symbolic() || value.is_symbolic() {
                return Err(OverrideError::AlreadyBound {
                    name: self.name.clone(),
                });
            }
            let scope = self.scope(value);
            let after = self.transform.transform(&scope, value)?;
            self.before = Some(value.clone());
            self.after = Some(after.clone());
            return Ok(after);
        }
        let scope = self.scope(value);
        let result = self
            .transform
            .build(&scope, value)
            .and_then(|_| self.transform.transform(&scope, value));
        match result {
            Ok(after) => {
                debug!(
                    overrider = %self.name,
                    kind = self.transform.kind(),
                    domain = %value.domain(),
                    shape = ?value.shape(),
                    "overrider built"
                );
                self.before = Some(value.clone());
                self.after = Some(after.clone());
                Ok(after)
            }
            Err(err) => {
                self.transform.reset();
                Err(err)
            }
        }
    }

    fn update(&mut self) -> OverrideResult<()> {
        let before = self.bound()?.clone();
        let scope = self.scope(&before);
        let saved = self.save()?;
        let result = self.transform.update(&scope, &before).and_then(|_| {
            if before.is_symbolic() {
                Ok(None)
            } else {
                self.transform.transform(&scope, &before).map(Some)
            }
        });
        match result {
            Ok(after) => {
                if after.is_some() {
                    self.after = after;
                }
                debug!(overrider = %self.name, kind = self.transform.kind(), "overrider updated");
                Ok(())
            }
            Err(err) => {
                warn!(overrider = %self.name, error = %err, "update failed, state rolled back");
                self.restore(saved)?;
                Err(err)
            }
        }
    }

    fn assign(&mut self) -> OverrideResult<()> {
        let before = self.bound()?;
        let after = self.after.as_ref().ok_or_else(|| OverrideError::NotApplied {
            name: self.name.clone(),
        })?;
        if let Some(next) = write_back(before, after)? {
            self.before = Some(next);
        }
        info!(overrider = %self.name, kind = self.transform.kind(), "overridden value assigned");
        Ok(())
    }

    fn reset(&mut self) {
        self.before = None;
        self.after = None;
        self.transform.reset();
    }

    fn before(&self) -> Option<&Value> {
        self.before.as_ref()
    }

    fn after(&self) -> Option<&Value> {
        self.after.as_ref()
    }

    fn report(&self) -> OverrideResult<Vec<OverrideReport>> {
        let (Some(before), Some(after)) = (&self.before, &self.after) else {
            return Err(OverrideError::NotApplied {
                name: self.name.clone(),
            });
        };
        let entries = self.transform.report(before, after)?;
        Ok(vec![OverrideReport::new(
            self.name.clone(),
            self.transform.kind(),
            entries,
        )])
    }

    fn variables(&self) -> Vec<Tensor> {
        self.transform.variables()
    }

    fn save(&self) -> OverrideResult<SavedState> {
        Ok(SavedState::new(Saved {
            transform: self.transform.clone(),
            tensors: read_tensors(self.transform.variables())?,
            before: self.before.clone(),
            after: self.after.clone(),
        }))
    }

    fn restore(&mut self, saved: SavedState) -> OverrideResult<()> {
        let saved: Saved<T> = saved.into_inner(&self.name)?;
        write_tensors(saved.tensors)?;
        self.transform = saved.transform;
        self.before = saved.before;
        self.after = saved.after;
        Ok(())
    }
}

/// Identity overrider.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyOverrider;

impl Transform for EmptyOverrider {
    fn kind(&self) -> &'static str {
        "EmptyOverrider"
    }

    fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use ndarray::array;

    /// Doubles its input; `update` bumps the factor.
    #[derive(Clone)]
    struct Scale {
        factor: f64,
    }

    /// Scales like [`Scale`] but refuses factors above `limit`.
    #[derive(Clone)]
    struct Capped {
        factor: f64,
        limit: f64,
    }

    impl Transform for Capped {
        fn kind(&self) -> &'static str {
            "Capped"
        }

        fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
            if self.factor > self.limit {
                return Err(OverrideError::invalid("Capped", "factor over limit"));
            }
            ops::mul(value, &Value::Constant(self.factor))
        }

        fn update(&mut self, _scope: &Scope, _before: &Value) -> OverrideResult<()> {
            self.factor += 1.0;
            Ok(())
        }
    }

    impl Transform for Scale {
        fn kind(&self) -> &'static str {
            "Scale"
        }

        fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
            ops::mul(value, &Value::Constant(self.factor))
        }

        fn update(&mut self, _scope: &Scope, _before: &Value) -> OverrideResult<()> {
            self.factor += 1.0;
            Ok(())
        }
    }

    #[test]
    fn update_and_assign_require_apply() {
        let mut o = Overriding::new("o", EmptyOverrider);
        assert!(matches!(o.update(), Err(OverrideError::NotApplied { .. })));
        assert!(matches!(o.assign(), Err(OverrideError::NotApplied { .. })));
        assert!(!o.is_applied());
    }

    #[test]
    fn immediate_update_recomputes_eagerly() {
        let mut o = Overriding::new("o", Scale { factor: 2.0 });
        let x = Value::from(array![1.0f32, 2.0].into_dyn());
        let y = o.apply(&x).unwrap();
        assert_eq!(y.evaluate().unwrap(), array![2.0f32, 4.0].into_dyn());
        o.update().unwrap();
        assert_eq!(
            o.after().unwrap().evaluate().unwrap(),
            array![3.0f32, 6.0].into_dyn()
        );
        o.assign().unwrap();
        assert_eq!(
            o.before().unwrap().evaluate().unwrap(),
            array![3.0f32, 6.0].into_dyn()
        );
    }

    #[test]
    fn failed_update_keeps_previous_state() {
        let mut o = Overriding::new("o", Capped { factor: 2.0, limit: 3.0 });
        let x = Value::from(array![1.0f32, 2.0].into_dyn());
        o.apply(&x).unwrap();
        o.update().unwrap();
        assert!(o.update().is_err());
        assert_eq!(o.transform().factor, 3.0);
        assert_eq!(
            o.after().unwrap().evaluate().unwrap(),
            array![3.0f32, 6.0].into_dyn()
        );
    }

    #[test]
    fn restore_rejects_foreign_state() {
        let x = Value::from(array![1.0f32].into_dyn());
        let mut a = Overriding::new("a", Scale { factor: 2.0 });
        let mut b = Overriding::new("b", EmptyOverrider);
        a.apply(&x).unwrap();
        b.apply(&x).unwrap();
        let saved = b.save().unwrap();
        assert!(matches!(
            a.restore(saved),
            Err(OverrideError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn symbolic_binding_is_exclusive_until_reset() {
        let graph = Graph::new();
        let a = graph.variable("a", array![1.0f32].into_dyn(), true);
        let b = graph.variable("b", array![1.0f32].into_dyn(), true);
        let mut o = Overriding::new("o", Scale { factor: 2.0 });
        let first = o.apply(&Value::from(a.clone())).unwrap();
        let again = o.apply(&Value::from(a.clone())).unwrap();
        assert!(first.as_tensor().unwrap().same_node(again.as_tensor().unwrap()));
        assert!(matches!(
            o.apply(&Value::from(b.clone())),
            Err(OverrideError::AlreadyBound { .. })
        ));
        o.reset();
        assert!(o.apply(&Value::from(b)).is_ok());
    }

    #[test]
    fn assign_into_non_variable_fails() {
        let graph = Graph::new();
        let c = graph.constant(array![1.0f32].into_dyn());
        let mut o = Overriding::new("o", EmptyOverrider);
        o.apply(&Value::from(c)).unwrap();
        assert!(matches!(o.assign(), Err(OverrideError::NotVariable { .. })));
    }

    #[test]
    fn symbolic_assign_writes_variable_storage() {
        let graph = Graph::new();
        let w = graph.variable("w", array![1.0f32, -1.0].into_dyn(), true);
        let mut o = Overriding::new("o", Scale { factor: 3.0 });
        o.apply(&Value::from(w.clone())).unwrap();
        o.assign().unwrap();
        assert_eq!(w.eval().unwrap(), array![3.0f32, -3.0].into_dyn());
    }
}
