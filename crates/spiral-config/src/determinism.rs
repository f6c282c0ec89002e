// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Seeding of the random streams drawn by overriders (stochastic rounding,
//! stochastic binarisation).
//!
//! Each stream is identified by a label such as `"conv1/weights/rounding"`.
//! An explicit seed always wins. Without one the process policy decides:
//! labels hash into the policy's base seed when `SPIRAL_DETERMINISTIC` is
//! set, otherwise the stream draws from OS entropy.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use rand::{rngs::StdRng, SeedableRng};

pub const ENABLED_VAR: &str = "SPIRAL_DETERMINISTIC";
pub const SEED_VAR: &str = "SPIRAL_DETERMINISTIC_SEED";
pub const DEFAULT_SEED: u64 = 42;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    pub enabled: bool,
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: DEFAULT_SEED,
        }
    }
}

fn flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "off" | "no"
    )
}

impl DeterminismConfig {
    /// Policy for the raw values of [`ENABLED_VAR`] and [`SEED_VAR`]. An
    /// unparsable seed falls back to [`DEFAULT_SEED`].
    pub fn from_vars(enabled: Option<&str>, seed: Option<&str>) -> Self {
        Self {
            enabled: enabled.map(flag).unwrap_or(false),
            base_seed: seed
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(DEFAULT_SEED),
        }
    }

    fn from_env() -> Self {
        let enabled = std::env::var(ENABLED_VAR).ok();
        let seed = std::env::var(SEED_VAR).ok();
        Self::from_vars(enabled.as_deref(), seed.as_deref())
    }

    /// Seed of the stream called `label`.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.base_seed.hash(&mut hasher);
        label.hash(&mut hasher);
        hasher.finish()
    }
}

static POLICY: OnceLock<DeterminismConfig> = OnceLock::new();

/// Process policy, read from the environment on first use.
pub fn config() -> &'static DeterminismConfig {
    POLICY.get_or_init(DeterminismConfig::from_env)
}

/// Installs `policy` unless one is already in effect, and returns the policy
/// in effect.
pub fn configure(policy: DeterminismConfig) -> &'static DeterminismConfig {
    POLICY.get_or_init(|| policy)
}

/// Random stream for `label`.
pub fn rng_for(label: &str, seed: Option<u64>) -> StdRng {
    let derived = match seed {
        Some(base_seed) => Some(
            DeterminismConfig {
                enabled: true,
                base_seed,
            }
            .seed_for(label),
        ),
        None => {
            let policy = config();
            policy.enabled.then(|| policy.seed_for(label))
        }
    };
    match derived {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn draws(mut rng: StdRng) -> Vec<u32> {
        (0..4).map(|_| rng.gen()).collect()
    }

    #[test]
    fn unset_variables_disable_seeding() {
        assert_eq!(DeterminismConfig::from_vars(None, None), DeterminismConfig::default());
    }

    #[test]
    fn flags_and_seeds_are_parsed_leniently() {
        let policy = DeterminismConfig::from_vars(Some("1"), Some(" 1337 "));
        assert!(policy.enabled);
        assert_eq!(policy.base_seed, 1337);

        for off in ["0", "off", "False", "no", ""] {
            assert!(!DeterminismConfig::from_vars(Some(off), None).enabled, "{off}");
        }
        let fallback = DeterminismConfig::from_vars(Some("yes"), Some("many"));
        assert!(fallback.enabled);
        assert_eq!(fallback.base_seed, DEFAULT_SEED);
    }

    #[test]
    fn labels_select_independent_streams() {
        let policy = DeterminismConfig {
            enabled: true,
            base_seed: 99,
        };
        assert_eq!(policy.seed_for("alpha"), policy.seed_for("alpha"));
        assert_ne!(policy.seed_for("alpha"), policy.seed_for("beta"));
    }

    #[test]
    fn explicit_seeds_give_reproducible_streams() {
        let first = draws(rng_for("w/rounding", Some(7)));
        assert_eq!(first, draws(rng_for("w/rounding", Some(7))));
        assert_ne!(first, draws(rng_for("b/rounding", Some(7))));
        assert_ne!(first, draws(rng_for("w/rounding", Some(8))));
    }
}
