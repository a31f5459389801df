use crate::error::{EngineError, Result};
use crate::providers::{Context, ValueProvider};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeSet;
use std::sync::Arc;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a step. Stable across platforms and toolchains, unlike `std` hashers.
fn fnv1a_mix(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Perturbs another provider's values by `1 + N(0, noise_factor)`.
///
/// The draw depends only on the key, the context and the iteration seed, so the
/// same lookup always returns the same value within an iteration while
/// different seeds give independent Monte-Carlo samples. Lookups are hashed
/// with FNV-1a; `StdRng` keeps sequences stable for a given `rand` release.
pub struct NoisyDriverProvider {
    inner: Arc<dyn ValueProvider>,
    noise_factor: f64,
    seed: u64,
    keys: Option<BTreeSet<String>>,
    name: String,
}

impl NoisyDriverProvider {
    pub fn new(inner: Arc<dyn ValueProvider>, noise_factor: f64, seed: u64) -> Result<Self> {
        if !(0.0..=1.0).contains(&noise_factor) {
            return Err(EngineError::InvalidConfiguration(format!(
                "noise factor must be within 0.0..=1.0, got {}",
                noise_factor
            )));
        }
        let name = format!("noisy {} (seed {})", inner.name(), seed);
        Ok(Self {
            inner,
            noise_factor,
            seed,
            keys: None,
            name,
        })
    }

    /// Restricts the noise to these keys; others pass through unchanged.
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn perturbs(&self, key: &str) -> bool {
        self.noise_factor > 0.0 && self.keys.as_ref().map_or(true, |keys| keys.contains(key))
    }

    fn draw(&self, key: &str, ctx: &Context) -> Result<f64> {
        let mut hash = fnv1a_mix(FNV_OFFSET_BASIS, &self.seed.to_le_bytes());
        for part in [key.as_bytes(), &b"\0"[..], ctx.entity_id.as_bytes(), &b"\0"[..]] {
            hash = fnv1a_mix(hash, part);
        }
        hash = fnv1a_mix(hash, &ctx.scenario_id.to_le_bytes());
        hash = fnv1a_mix(hash, &ctx.effective_period_id()?.to_le_bytes());

        let mut rng = StdRng::seed_from_u64(hash);
        let normal = Normal::new(0.0, self.noise_factor)
            .map_err(|e| EngineError::InvalidConfiguration(format!("noise distribution: {}", e)))?;
        Ok(normal.sample(&mut rng))
    }
}

impl ValueProvider for NoisyDriverProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_value(&self, key: &str, ctx: &Context) -> bool {
        self.inner.has_value(key, ctx)
    }

    fn get_value(&self, key: &str, ctx: &Context) -> Result<f64> {
        let value = self.inner.get_value(key, ctx)?;
        if !self.perturbs(key) {
            return Ok(value);
        }
        Ok(value * (1.0 + self.draw(key, ctx)?))
    }
}
