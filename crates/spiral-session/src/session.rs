// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{ArrayD, ArrayViewD, Axis};
use spiral_config::SystemConfig;
use spiral_override::{
    build_overrider, CompressionReport, Graph, Overrider, OverriderConfig, Tensor, Value,
};
use tracing::{debug, info, info_span, warn};

use crate::checkpoint::CheckpointLoader;
use crate::error::{SessionError, SessionResult};
use crate::preprocess::{Batch, BatchSource, Mode, Preprocess};

struct Registered {
    variable: String,
    overrider: Box<dyn Overrider>,
}

/// Owns the parameter graph and the overriders attached to its variables.
pub struct Session {
    config: SystemConfig,
    graph: Graph,
    overriders: Vec<Registered>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("graph", &self.graph)
            .field(
                "overridden",
                &self
                    .overriders
                    .iter()
                    .map(|r| r.variable.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Session {
    pub fn new(config: SystemConfig) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            graph: Graph::new(),
            overriders: Vec::new(),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Declares a parameter of the session graph.
    pub fn variable(&self, name: &str, value: ArrayD<f32>, trainable: bool) -> Tensor {
        self.graph.variable(name, value, trainable)
    }

    /// Builds an overrider from `config` and binds it to `variable`. Returns
    /// the overridden tensor that layers should consume instead.
    pub fn override_variable(
        &mut self,
        variable: &str,
        config: &OverriderConfig,
    ) -> SessionResult<Tensor> {
        let overrider = build_overrider(variable, config, self.config.seed)?;
        self.attach(variable, overrider)
    }

    /// Binds an already constructed overrider to `variable`.
    pub fn attach(
        &mut self,
        variable: &str,
        mut overrider: Box<dyn Overrider>,
    ) -> SessionResult<Tensor> {
        if self.overriders.iter().any(|r| r.variable == variable) {
            return Err(SessionError::AlreadyOverridden(variable.to_string()));
        }
        let parameter = self
            .graph
            .find_variable(variable)
            .ok_or_else(|| SessionError::UnknownVariable(variable.to_string()))?;
        let after = overrider.apply(&Value::Symbolic(parameter))?;
        let tensor = after
            .as_tensor()
            .cloned()
            .ok_or_else(|| {
                SessionError::Setup(format!("{variable} was not overridden symbolically"))
            })?;
        info!(variable, overrider = overrider.name(), "overrode variable");
        self.overriders.push(Registered {
            variable: variable.to_string(),
            overrider,
        });
        Ok(tensor)
    }

    /// The overridden value of `variable`, or the raw variable when no
    /// overrider is attached.
    pub fn parameter(&self, variable: &str) -> SessionResult<Tensor> {
        if let Some(tensor) = self
            .overriders
            .iter()
            .find(|r| r.variable == variable)
            .and_then(|r| r.overrider.after())
            .and_then(Value::as_tensor)
        {
            return Ok(tensor.clone());
        }
        self.graph
            .find_variable(variable)
            .ok_or_else(|| SessionError::UnknownVariable(variable.to_string()))
    }

    pub fn overrider(&self, variable: &str) -> Option<&dyn Overrider> {
        self.overriders
            .iter()
            .find(|r| r.variable == variable)
            .map(|r| r.overrider.as_ref())
    }

    /// Runs every overrider's periodic update, in attachment order.
    pub fn update_overriders(&mut self) -> SessionResult<()> {
        let _span = info_span!("update_overriders", count = self.overriders.len()).entered();
        for registered in &mut self.overriders {
            registered.overrider.update()?;
            debug!(variable = %registered.variable, "updated overrider");
        }
        Ok(())
    }

    /// Writes every overridden value back into its variable.
    pub fn assign_overriders(&mut self) -> SessionResult<()> {
        for registered in &mut self.overriders {
            registered.overrider.assign()?;
        }
        info!(count = self.overriders.len(), "assigned overridden values");
        Ok(())
    }

    /// Overrider metrics plus the parameter count that survives pruning.
    pub fn reports(&self) -> SessionResult<CompressionReport> {
        let mut original = 0;
        let mut remaining = 0;
        let mut reports = Vec::new();
        for registered in &self.overriders {
            let overrider = &registered.overrider;
            if let Some(before) = overrider.before() {
                original += before.len();
            }
            if let Some(after) = overrider.after() {
                remaining += after.evaluate()?.iter().filter(|v| **v != 0.0).count();
            }
            reports.extend(overrider.report()?);
        }
        Ok(CompressionReport::new(original, remaining, reports))
    }

    /// Trainable variables of the graph, including those created by
    /// overriders.
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.graph.trainable_variables()
    }

    /// Restores `path` through `loader`.
    pub fn load_checkpoint(
        &self,
        loader: &mut dyn CheckpointLoader,
        path: &std::path::Path,
    ) -> SessionResult<usize> {
        loader.load(path, &self.graph)
    }
}

/// Model-specific forward pass and evaluation.
pub trait Task {
    /// Predictions for one device shard; axis 0 indexes the shard's images.
    fn predict(&mut self, session: &Session, shard: &Batch) -> SessionResult<ArrayD<f32>>;

    /// Consumes the predictions of one full batch.
    fn test(&mut self, names: &[String], predictions: ArrayViewD<'_, f32>) -> SessionResult<()>;
}

/// Evaluation driver: restores the configured checkpoint up front and then
/// runs the task over every batch.
pub struct Test<T> {
    session: Session,
    preprocess: Preprocess,
    task: T,
}

impl<T: Task> Test<T> {
    pub fn new(
        session: Session,
        preprocess: Preprocess,
        task: T,
        loader: &mut dyn CheckpointLoader,
    ) -> SessionResult<Self> {
        if preprocess.mode() != Mode::Test {
            return Err(SessionError::Setup(format!(
                "test session needs test preprocessing, got {}",
                preprocess.mode()
            )));
        }
        match session.config().checkpoint.load.clone() {
            Some(path) => {
                session.load_checkpoint(loader, &path)?;
            }
            None => warn!("no checkpoint configured; testing initial parameters"),
        }
        Ok(Self {
            session,
            preprocess,
            task,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    /// Runs every batch of `source`. Returns the number of images tested.
    pub fn test(&mut self, source: &mut dyn BatchSource) -> SessionResult<usize> {
        let mut images = 0;
        let mut batches = 0;
        while let Some(batch) = source.next_batch()? {
            let shards = self.preprocess.split(&batch)?;
            let mut outputs = Vec::with_capacity(shards.len());
            for shard in &shards {
                outputs.push(self.task.predict(&self.session, shard)?);
            }
            let views: Vec<ArrayViewD<f32>> = outputs.iter().map(|o| o.view()).collect();
            let predictions = ndarray::concatenate(Axis(0), &views)
                .map_err(|err| SessionError::Task(err.to_string()))?;
            if predictions.len_of(Axis(0)) != batch.len() {
                return Err(SessionError::Task(format!(
                    "{} predictions for {} images",
                    predictions.len_of(Axis(0)),
                    batch.len()
                )));
            }
            self.task.test(&batch.names, predictions.view())?;
            images += batch.len();
            batches += 1;
            debug!(batch = batches, images, "tested batch");
        }
        info!(batches, images, "test finished");
        Ok(images)
    }

    pub fn into_task(self) -> T {
        self.task
    }
}
