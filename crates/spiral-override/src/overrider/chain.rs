// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fmt;

use tracing::{info, warn};

use super::{write_back, Overrider, SavedState};
use crate::error::{OverrideError, OverrideResult};
use crate::graph::Tensor;
use crate::report::OverrideReport;
use crate::value::Value;

/// Ordered composition of overriders. Each child sees the previous child's
/// output; the final output is written into the chain's own parameter.
pub struct ChainOverrider {
    name: String,
    children: Vec<Box<dyn Overrider>>,
    before: Option<Value>,
    after: Option<Value>,
}

impl fmt::Debug for ChainOverrider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.children.iter().map(|c| c.name()).collect();
        f.debug_struct("ChainOverrider")
            .field("name", &self.name)
            .field("children", &names)
            .finish()
    }
}

impl ChainOverrider {
    pub fn new(name: impl Into<String>, children: Vec<Box<dyn Overrider>>) -> Self {
        Self {
            name: name.into(),
            children,
            before: None,
            after: None,
        }
    }

    pub fn children(&self) -> &[Box<dyn Overrider>] {
        &self.children
    }

    fn update_children(&mut self, before: &Value) -> OverrideResult<()> {
        for index in 0..self.children.len() {
            self.children[index].update()?;
            if before.is_symbolic() {
                continue;
            }
            let Some(output) = self.children[index].after().cloned() else {
                continue;
            };
            self.after = Some(self.thread(index + 1, &output)?);
        }
        Ok(())
    }

    fn thread(&mut self, from: usize, value: &Value) -> OverrideResult<Value> {
        let mut current = value.clone();
        for child in self.children.iter_mut().skip(from) {
            current = child.apply(&current)?;
        }
        Ok(current)
    }
}

impl Overrider for ChainOverrider {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, value: &Value) -> OverrideResult<Value> {
        if let (Some(before), Some(after)) = (&self.before, &self.after) {
            if before.same_binding(value) {
                return Ok(after.clone());
            }
        }
        let after = self.thread(0, value)?;
        self.before = Some(value.clone());
        self.after = Some(after.clone());
        Ok(after)
    }

    fn update(&mut self) -> OverrideResult<()> {
        let before = self.before.clone().ok_or_else(|| OverrideError::NotApplied {
            name: self.name.clone(),
        })?;
        let saved = self.save()?;
        if let Err(err) = self.update_children(&before) {
            warn!(overrider = %self.name, error = %err, "chain update failed, children rolled back");
            self.restore(saved)?;
            return Err(err);
        }
        Ok(())
    }

    fn assign(&mut self) -> OverrideResult<()> {
        let (Some(before), Some(after)) = (&self.before, &self.after) else {
            return Err(OverrideError::NotApplied {
                name: self.name.clone(),
            });
        };
        if let Some(next) = write_back(before, after)? {
            self.before = Some(next);
        }
        info!(overrider = %self.name, children = self.children.len(), "chained value assigned");
        Ok(())
    }

    fn reset(&mut self) {
        self.before = None;
        self.after = None;
        for child in &mut self.children {
            child.reset();
        }
    }

    fn before(&self) -> Option<&Value> {
        self.before.as_ref()
    }

    fn after(&self) -> Option<&Value> {
        self.after.as_ref()
    }

    fn report(&self) -> OverrideResult<Vec<OverrideReport>> {
        let mut reports = Vec::new();
        for child in &self.children {
            reports.extend(child.report()?);
        }
        Ok(reports)
    }

    fn variables(&self) -> Vec<Tensor> {
        self.children.iter().flat_map(|c| c.variables()).collect()
    }

    fn save(&self) -> OverrideResult<SavedState> {
        let children = self
            .children
            .iter()
            .map(|child| child.save())
            .collect::<OverrideResult<Vec<_>>>()?;
        Ok(SavedState::new(ChainState {
            children,
            before: self.before.clone(),
            after: self.after.clone(),
        }))
    }

    fn restore(&mut self, saved: SavedState) -> OverrideResult<()> {
        let saved: ChainState = saved.into_inner(&self.name)?;
        if saved.children.len() != self.children.len() {
            return Err(OverrideError::invalid(
                "restore",
                format!("{} saved {} children", self.name, saved.children.len()),
            ));
        }
        for (child, state) in self.children.iter_mut().zip(saved.children) {
            child.restore(state)?;
        }
        self.before = saved.before;
        self.after = saved.after;
        Ok(())
    }
}

struct ChainState {
    children: Vec<SavedState>,
    before: Option<Value>,
    after: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrider::{EmptyOverrider, Overriding, Scope, Transform};
    use crate::prune::MeanStdPruner;
    use ndarray::array;

    /// Identity whose `update` always fails.
    #[derive(Clone)]
    struct Stuck;

    impl Transform for Stuck {
        fn kind(&self) -> &'static str {
            "Stuck"
        }

        fn transform(&mut self, _scope: &Scope, value: &Value) -> OverrideResult<Value> {
            Ok(value.clone())
        }

        fn update(&mut self, _scope: &Scope, _before: &Value) -> OverrideResult<()> {
            Err(OverrideError::invalid("Stuck", "cannot update"))
        }
    }

    #[test]
    fn empty_chain_is_identity() {
        let mut chain = ChainOverrider::new("chain", Vec::new());
        let x = Value::from(array![1.5f32, -2.0].into_dyn());
        let y = chain.apply(&x).unwrap();
        assert_eq!(y.evaluate().unwrap(), x.evaluate().unwrap());
        assert!(chain.report().unwrap().is_empty());
    }

    #[test]
    fn chain_reports_every_child() {
        let children: Vec<Box<dyn Overrider>> = vec![
            Box::new(Overriding::new("a", EmptyOverrider)),
            Box::new(Overriding::new("b", EmptyOverrider)),
        ];
        let mut chain = ChainOverrider::new("chain", children);
        chain.apply(&Value::Constant(1.0)).unwrap();
        chain.update().unwrap();
        let names: Vec<String> = chain.report().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn failing_child_rolls_back_the_whole_chain() {
        let children: Vec<Box<dyn Overrider>> = vec![
            Box::new(Overriding::new("prune", MeanStdPruner::new(0.0, 1.0).unwrap())),
            Box::new(Overriding::new("stuck", Stuck)),
        ];
        let mut chain = ChainOverrider::new("chain", children);
        let x = Value::from(array![0.1f32, -0.2, 1.0, -3.0, 0.5].into_dyn());
        let applied = chain.apply(&x).unwrap().evaluate().unwrap();

        assert!(chain.update().is_err());
        assert_eq!(chain.after().unwrap().evaluate().unwrap(), applied);
        let pruned = chain.children()[0].after().unwrap().evaluate().unwrap();
        assert_eq!(pruned, applied);
        let report = chain.children()[0].report().unwrap().remove(0);
        assert_eq!(report.get("multiplier"), Some(0.0));
    }
}
