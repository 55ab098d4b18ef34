//! Deterministic random number generation
//!
//! Uses the xorshift64* algorithm. All randomness in the simulator MUST go
//! through this module: property 6 of the engine contract (two runs with
//! identical config produce byte-identical histories) only holds if every
//! stochastic agent draws from a seeded generator.

/// Deterministic random number generator using xorshift64*
///
/// # Example
/// ```
/// use water_simulator_core_rs::RngManager;
///
/// let mut rng = RngManager::new(12345);
/// let a = rng.next_f64();
/// assert!((0.0..1.0).contains(&a));
/// ```
#[derive(Debug, Clone)]
pub struct RngManager {
    state: u64,
}

impl RngManager {
    /// Create a new RNG with the given seed
    ///
    /// A zero seed is remapped to 1 (xorshift requires nonzero state).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    /// Next raw 64-bit value
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform f64 in [0.0, 1.0)
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / ((1u64 << 53) as f64))
    }

    /// Uniform f64 in [lo, hi)
    ///
    /// # Panics
    /// Panics if `lo >= hi`.
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        assert!(lo < hi, "lo must be less than hi");
        lo + (hi - lo) * self.next_f64()
    }

    /// Multiplicative noise around `base`: `base * (1 ± spread)`
    ///
    /// `spread` is a fraction, e.g. 0.2 for ±20%. Used by stochastic
    /// disturbance agents (rainfall bursts) so that noisy scenarios remain
    /// reproducible under a fixed seed.
    pub fn jitter(&mut self, base: f64, spread: f64) -> f64 {
        base * (1.0 + self.uniform(-spread, spread))
    }
}
