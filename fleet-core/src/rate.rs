//! Pacing arithmetic (§4.2, §9 "Pacing arithmetic"). Kept separate from
//! `TaskQueue`/`DbTaskRepo` so the jitter math has its own focused unit
//! tests; the actual interval is always applied server-side via
//! `make_interval`, never string-built, so only the *duration* crosses this
//! boundary.

use rand::Rng;
use std::time::Duration;

/// Base inter-send delay for a profile sending at `max_messages_per_hour`,
/// before jitter. `0` means "unlimited", which has no base delay.
pub fn hourly_pace_delay(max_messages_per_hour: u32) -> Duration {
    if max_messages_per_hour == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(3600.0 / max_messages_per_hour as f64)
    }
}

/// Applies a uniform jitter factor in `[1 - randomness, 1 + randomness]`.
/// `randomness` outside `[0, 1)` is clamped so a misconfigured value can
/// never produce a negative delay.
pub fn jittered(base: Duration, randomness: f64, rng: &mut impl Rng) -> Duration {
    let randomness = randomness.clamp(0.0, 0.999);
    let factor = rng.random_range((1.0 - randomness)..=(1.0 + randomness));
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// §9's resolution of the `cycle_delay_minutes` vs. `max_messages_per_hour`
/// open question: the effective delay applied to `next_available_at` on
/// success is `max(cycle_delay, hourly_pace_delay)`, jittered once as a
/// whole so neither window can be used to circumvent the other.
pub fn effective_cycle_delay(
    cycle_delay: Duration,
    max_messages_per_hour: u32,
    randomness: f64,
    rng: &mut impl Rng,
) -> Duration {
    let hourly = hourly_pace_delay(max_messages_per_hour);
    jittered(cycle_delay.max(hourly), randomness, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn hourly_pace_delay_is_inverse_of_rate() {
        assert_eq!(hourly_pace_delay(20), Duration::from_secs(180));
        assert_eq!(hourly_pace_delay(0), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_configured_band() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let base = Duration::from_secs(100);
        for _ in 0..1000 {
            let d = jittered(base, 0.2, &mut rng);
            assert!(d.as_secs_f64() >= 80.0 && d.as_secs_f64() <= 120.0);
        }
    }

    #[test]
    fn effective_delay_prefers_the_larger_window() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        // cycle_delay (10 min) dominates a generous hourly cap.
        let d = effective_cycle_delay(Duration::from_secs(600), 1000, 0.0, &mut rng);
        assert_eq!(d, Duration::from_secs(600));

        // A tight hourly cap (2/hour -> 1800s base) dominates a short cycle_delay.
        let d = effective_cycle_delay(Duration::from_secs(10), 2, 0.0, &mut rng);
        assert_eq!(d, Duration::from_secs(1800));
    }
}
