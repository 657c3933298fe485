// lobbybot-core/src/utils/backoff.rs

use tokio::time::Duration;

/// Hard cap on the delay between reconnect attempts.
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Reconnects stop entirely past this attempt count; the account is left
/// terminally disconnected until explicitly restarted.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 50;

/// Exponential backoff for reconnect attempt `attempts` (0-based):
/// `min(1000 * 2^attempts, 30_000)` ms.
pub fn reconnect_delay(attempts: u32) -> Duration {
    // The cap is reached at attempt 5; clamp the shift so it cannot overflow.
    let ms = (1000u64 << attempts.min(5)).min(MAX_RECONNECT_DELAY_MS);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let expected = [1000u64, 2000, 4000, 8000, 16000, 30000, 30000, 30000];
        for (attempt, want) in expected.iter().enumerate() {
            assert_eq!(
                reconnect_delay(attempt as u32),
                Duration::from_millis(*want),
                "attempt {}",
                attempt
            );
        }
    }

    #[test]
    fn large_attempt_counts_stay_capped() {
        assert_eq!(
            reconnect_delay(MAX_RECONNECT_ATTEMPTS - 1),
            Duration::from_millis(MAX_RECONNECT_DELAY_MS)
        );
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_millis(MAX_RECONNECT_DELAY_MS));
    }
}
