// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use spiral_override::Graph;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};

/// Restores variable storage from a checkpoint.
pub trait CheckpointLoader {
    /// Writes every stored variable found in `graph` and returns how many were
    /// restored.
    fn load(&mut self, path: &Path, graph: &Graph) -> SessionResult<usize>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredVariable {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    variables: BTreeMap<String, StoredVariable>,
}

/// Variables stored by name as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCheckpoint;

impl JsonCheckpoint {
    pub fn new() -> Self {
        Self
    }

    /// Saves every variable of `graph`. Returns how many were written.
    pub fn save(&self, path: &Path, graph: &Graph) -> SessionResult<usize> {
        let mut snapshot = Snapshot::default();
        for tensor in graph.variables() {
            let Some(name) = graph.variable_name(&tensor) else {
                continue;
            };
            let value = tensor.eval()?;
            snapshot.variables.insert(
                name,
                StoredVariable {
                    shape: value.shape().to_vec(),
                    data: value.iter().copied().collect(),
                },
            );
        }
        let file = File::create(path).map_err(|err| SessionError::checkpoint(path, err))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &snapshot)
            .map_err(|err| SessionError::checkpoint(path, err))?;
        info!(path = %path.display(), variables = snapshot.variables.len(), "saved checkpoint");
        Ok(snapshot.variables.len())
    }
}

impl CheckpointLoader for JsonCheckpoint {
    fn load(&mut self, path: &Path, graph: &Graph) -> SessionResult<usize> {
        let file = File::open(path).map_err(|err| SessionError::checkpoint(path, err))?;
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| SessionError::checkpoint(path, err))?;

        let mut restored = 0;
        for (name, stored) in snapshot.variables {
            let Some(tensor) = graph.find_variable(&name) else {
                warn!(variable = %name, "checkpoint variable missing from graph");
                continue;
            };
            let value = ArrayD::from_shape_vec(IxDyn(&stored.shape), stored.data)
                .map_err(|err| SessionError::checkpoint(path, format!("{name}: {err}")))?;
            graph.assign(&tensor, value)?;
            debug!(variable = %name, "restored variable");
            restored += 1;
        }
        info!(path = %path.display(), restored, "loaded checkpoint");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use spiral_override::OverrideError;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.json");

        let source = Graph::new();
        source.variable("w", array![[1.0f32, -2.0], [0.5, 4.0]].into_dyn(), true);
        source.variable("step", array![3.0f32].into_dyn(), false);
        assert_eq!(JsonCheckpoint::new().save(&path, &source).unwrap(), 2);

        let target = Graph::new();
        let w = target.variable("w", ArrayD::zeros(IxDyn(&[2, 2])), true);
        let restored = JsonCheckpoint::new().load(&path, &target).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(w.eval().unwrap(), array![[1.0f32, -2.0], [0.5, 4.0]].into_dyn());
    }

    #[test]
    fn shape_mismatch_fails_the_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let source = Graph::new();
        source.variable("w", ArrayD::zeros(IxDyn(&[3])), true);
        JsonCheckpoint::new().save(&path, &source).unwrap();

        let target = Graph::new();
        target.variable("w", ArrayD::zeros(IxDyn(&[2])), true);
        assert!(matches!(
            JsonCheckpoint::new().load(&path, &target),
            Err(SessionError::Override(OverrideError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn missing_file_is_a_checkpoint_error() {
        let dir = tempdir().unwrap();
        let graph = Graph::new();
        assert!(matches!(
            JsonCheckpoint::new().load(&dir.path().join("absent.json"), &graph),
            Err(SessionError::Checkpoint { .. })
        ));
    }
}
