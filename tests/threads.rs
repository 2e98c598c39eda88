//! Background thread usage does not grow with the subscription count.
//!
//! Kept in its own test binary so no other test spawns threads meanwhile.

use lpoll::{Registry, RegistryConfig};
use std::time::Duration;

#[cfg(target_os = "linux")]
fn thread_count() -> usize {
    let status = std::fs::read_to_string("/proc/self/status").unwrap();
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|count| count.trim().parse().ok())
        .unwrap()
}

#[cfg(target_os = "linux")]
#[test]
fn test_subscriptions_share_expiry_thread() {
    let registry: Registry<String> = Registry::with_config(RegistryConfig {
        dispatch_workers: 1,
        ..Default::default()
    })
    .unwrap();

    let before = thread_count();
    let ids: Vec<_> = (0..2000)
        .map(|_| registry.subscribe(Duration::from_secs(60), ["a"]).unwrap())
        .collect();
    let after = thread_count();

    assert_eq!(registry.len(), ids.len());
    assert!(
        after <= before + 2,
        "threads before={} after={} subscriptions={}",
        before,
        after,
        ids.len()
    );

    registry.shutdown();
}
