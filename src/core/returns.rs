use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::error::ConfigurationError;

/// Fixed cash sleeve held at every risk score, in percent.
pub const CASH_SLEEVE_PCT: f64 = 5.0;
pub const MIN_EQUITY_PCT: f64 = 20.0;
pub const MAX_EQUITY_PCT: f64 = 90.0;

const MIN_ANNUAL_RETURN: f64 = -0.95;
const MAX_ANNUAL_RETURN: f64 = 2.5;

/// Real (inflation-adjusted) annual return assumption, as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetAssumption {
    pub mean: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetAssumptions {
    pub equities: AssetAssumption,
    pub bonds: AssetAssumption,
    pub cash: AssetAssumption,
}

impl Default for AssetAssumptions {
    fn default() -> Self {
        Self {
            equities: AssetAssumption {
                mean: 0.07,
                volatility: 0.16,
            },
            bonds: AssetAssumption {
                mean: 0.03,
                volatility: 0.06,
            },
            cash: AssetAssumption {
                mean: 0.01,
                volatility: 0.01,
            },
        }
    }
}

impl AssetAssumptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value) in [
            ("equities.mean", self.equities.mean),
            ("bonds.mean", self.bonds.mean),
            ("cash.mean", self.cash.mean),
        ] {
            if !value.is_finite() || value <= MIN_ANNUAL_RETURN {
                return Err(ConfigurationError::AssetAssumption { field, value });
            }
        }
        for (field, value) in [
            ("equities.volatility", self.equities.volatility),
            ("bonds.volatility", self.bonds.volatility),
            ("cash.volatility", self.cash.volatility),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::AssetAssumption { field, value });
            }
        }
        Ok(())
    }
}

/// Portfolio split in percent; always sums to 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub equity_pct: f64,
    pub bond_pct: f64,
    pub cash_pct: f64,
}

impl Allocation {
    pub fn for_risk_score(risk_score: u32) -> Self {
        let equity_pct = (risk_score as f64 * 8.0 + 10.0).clamp(MIN_EQUITY_PCT, MAX_EQUITY_PCT);
        let cash_pct = CASH_SLEEVE_PCT;
        Self {
            equity_pct,
            bond_pct: 100.0 - equity_pct - cash_pct,
            cash_pct,
        }
    }

    fn blend(&self, f: impl Fn(&AssetAssumption) -> f64, assumptions: &AssetAssumptions) -> f64 {
        (self.equity_pct * f(&assumptions.equities)
            + self.bond_pct * f(&assumptions.bonds)
            + self.cash_pct * f(&assumptions.cash))
            / 100.0
    }
}

/// Source of annual real returns for the trial simulator.
///
/// Implementations must draw only from the supplied generator so that a
/// sample is fully determined by the generator's seed and the year.
pub trait ReturnModel: Send + Sync {
    fn annual_return(&self, year: u32, rng: &mut Rng) -> f64;

    fn expected_return(&self) -> f64;

    fn volatility(&self) -> f64;
}

/// Normal draw around the allocation-weighted mean and volatility. The
/// volatility blend is linear, which treats the asset classes as perfectly
/// correlated and errs on the wide side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendedNormalModel {
    allocation: Allocation,
    mean: f64,
    volatility: f64,
}

impl BlendedNormalModel {
    pub fn new(risk_score: u32) -> Self {
        Self::with_assumptions(risk_score, &AssetAssumptions::default())
    }

    pub fn with_assumptions(risk_score: u32, assumptions: &AssetAssumptions) -> Self {
        let allocation = Allocation::for_risk_score(risk_score);
        Self {
            allocation,
            mean: allocation.blend(|a| a.mean, assumptions),
            volatility: allocation.blend(|a| a.volatility, assumptions),
        }
    }

    pub fn allocation(&self) -> Allocation {
        self.allocation
    }
}

impl ReturnModel for BlendedNormalModel {
    fn annual_return(&self, _year: u32, rng: &mut Rng) -> f64 {
        (self.mean + self.volatility * rng.standard_normal())
            .clamp(MIN_ANNUAL_RETURN, MAX_ANNUAL_RETURN)
    }

    fn expected_return(&self) -> f64 {
        self.mean
    }

    fn volatility(&self) -> f64 {
        self.volatility
    }
}

/// Return for `year` of `trial`. Each (seed, year, trial) owns its own
/// stream, so the value does not depend on how trials are batched.
pub fn sample_year<M: ReturnModel + ?Sized>(model: &M, seed: u64, trial: u32, year: u32) -> f64 {
    let mut rng = Rng::new(derive_seed(seed, year, trial));
    model.annual_return(year, &mut rng)
}

/// Base seed is mixed before the indices are folded in, so nearby base seeds
/// share no trial streams.
pub fn derive_seed(base_seed: u64, year: u32, trial: u32) -> u64 {
    splitmix64(splitmix64(splitmix64(base_seed) ^ trial as u64) ^ year as u64)
}

/// Seed for the `run_index`-th of several runs sharing one base seed.
pub fn derive_run_seed(base_seed: u64, run_index: u64) -> u64 {
    splitmix64(splitmix64(base_seed) ^ run_index.rotate_left(29))
}

/// Seed for a run submitted without one. Distinct across calls in a process.
pub fn fresh_seed() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    derive_run_seed(nanos, n)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// xorshift64* generator with a Box-Muller normal cache.
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
    cached_normal: Option<f64>,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self {
            state,
            cached_normal: None,
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform in (0, 1).
    pub fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }

    pub fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.cached_normal.take() {
            return z;
        }

        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;

        let z0 = r * theta.cos();
        let z1 = r * theta.sin();
        self.cached_normal = Some(z1);
        z0
    }
}
