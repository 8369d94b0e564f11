//! Backoff calculation.
//!
//! Portable, sync-only math for reconnect delays. The stateful policy that
//! counts attempts and draws randomness lives in `tether-client`.
//!
//! - [`exponential_delay`]: `min(max_delay, base_delay * 2^attempt)`
//! - [`calculate_backoff_delay_with_random`]: the above with symmetric jitter

/// Default jitter factor (±10%).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Capped exponential delay without jitter.
///
/// `attempt` is zero-based: attempt 0 yields `base_delay_ms`.
#[must_use]
pub fn exponential_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    exponential.min(max_delay_ms)
}

/// Calculate backoff delay with explicit randomness.
///
/// `random` should be a value in `[0.0, 1.0]` from a PRNG. It is mapped to a
/// multiplier in `[1 - jitter, 1 + jitter]`, so a factor of 0.1 varies the
/// delay by ±10% around the capped exponential value.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let capped = exponential_delay(attempt, base_delay_ms, max_delay_ms);
    let jitter_factor = jitter_factor.clamp(0.0, 1.0);
    let random = random.clamp(0.0, 1.0);

    // Maps random [0,1] to [-jitter, +jitter]
    let jitter = 1.0 + (random * 2.0 - 1.0) * jitter_factor;
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
