use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};
use crate::limiter::{LoginLimitConfig, LoginLimiter};

fn limiter(max_attempts: u32, window_secs: u64, lockout_secs: u64) -> LoginLimiter {
    LoginLimiter::new(LoginLimitConfig {
        max_attempts,
        window_secs,
        lockout_secs,
    })
}

proptest! {
    // Locked exactly when the threshold is reached, and only for the lockout period
    #[test]
    fn test_lock_iff_threshold_reached(
        max in 1u32..10,
        failures in 0u32..20,
        window in 1u64..1000,
        lockout in 1u64..1000,
    ) {
        let limiter = limiter(max, window, lockout);
        let ip = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
        let t = 10_000;

        for n in 1..=failures {
            prop_assert_eq!(limiter.record_failure(ip, t), n);
        }

        prop_assert_eq!(limiter.is_locked(ip, t), failures >= max);
        prop_assert!(!limiter.is_locked(ip, t + lockout));
    }

    // Failures spaced further apart than the window never accumulate
    #[test]
    fn test_spaced_failures_never_lock(
        max in 2u32..10,
        window in 1u64..100,
        rounds in 1usize..30,
    ) {
        let limiter = limiter(max, window, 1_000);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        for i in 0..rounds {
            let t = 1 + i as u64 * (window + 1);
            prop_assert_eq!(limiter.record_failure(ip, t), 1);
            prop_assert!(!limiter.is_locked(ip, t));
        }
    }

    // Reset wins over any history
    #[test]
    fn test_reset_always_unlocks(
        failures in 0u32..50,
        now in 0u64..1_000_000,
    ) {
        let limiter = limiter(3, 60, 600);
        let ip = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));

        for _ in 0..failures {
            limiter.record_failure(ip, now);
        }
        limiter.reset(ip);

        prop_assert!(!limiter.is_locked(ip, now));
        prop_assert_eq!(limiter.record_failure(ip, now), 1);
    }

    // Sweeping never releases an IP that is still locked out
    #[test]
    fn test_sweep_keeps_active_lockouts(
        starts in prop::collection::vec(0u64..5_000, 1..20),
        sweep_at in 0u64..10_000,
    ) {
        let limiter = limiter(1, 30, 2_000);
        let mut locked = Vec::new();

        for (i, start) in starts.iter().enumerate() {
            let ip = IpAddr::V4(Ipv4Addr::new(10, 1, (i / 256) as u8, (i % 256) as u8));
            limiter.record_failure(ip, *start);
            if limiter.is_locked(ip, sweep_at) {
                locked.push(ip);
            }
        }

        limiter.sweep(sweep_at);
        for ip in locked {
            prop_assert!(limiter.is_locked(ip, sweep_at));
        }
    }
}
