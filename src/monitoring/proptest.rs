//! Property-Based Tests for the alert log
//!
//! # Test Properties
//!
//! 1. **Bounded**: the log never holds more than its capacity
//! 2. **FIFO**: the retained alerts are exactly the most recent ones, in order
//! 3. **Counting**: stats count every alert, including evicted ones

#![cfg(test)]

use proptest::prelude::*;

use super::alerts::{AlertManager, AlertType};

// =============================================================================
// Property Strategies
// =============================================================================

fn alert_type_strategy() -> impl Strategy<Value = AlertType> {
    prop_oneof![
        Just(AlertType::HighMemoryUsage),
        Just(AlertType::CriticalMemoryUsage),
        Just(AlertType::LowHitRate),
        Just(AlertType::HighLatency),
        Just(AlertType::HighEvictionRate),
        Just(AlertType::MemoryFragmentation),
        Just(AlertType::BackendUnavailable),
    ]
}

// =============================================================================
// Ring Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the log is bounded and keeps the newest alerts in order.
    #[test]
    fn prop_ring_bounded_fifo(
        capacity in 1usize..50,
        types in prop::collection::vec(alert_type_strategy(), 0..200),
    ) {
        let manager = AlertManager::with_capacity(capacity);
        for (i, alert_type) in types.iter().enumerate() {
            manager.trigger_alert(*alert_type, format!("alert {}", i));
            prop_assert!(manager.len() <= capacity);
        }

        let expected: Vec<String> = (0..types.len())
            .rev()
            .take(capacity)
            .map(|i| format!("alert {}", i))
            .collect();
        let retained: Vec<String> = manager
            .history(Some(capacity))
            .into_iter()
            .map(|a| a.message)
            .collect();
        prop_assert_eq!(retained, expected);
        prop_assert_eq!(manager.stats().total_alerts, types.len() as u64);
    }

    /// Property: severity depends on the alert type alone.
    #[test]
    fn prop_severity_pure(alert_type in alert_type_strategy(), message in ".{0,40}") {
        let manager = AlertManager::new();
        let alert = manager.trigger_alert(alert_type, message);
        prop_assert_eq!(alert.severity, alert_type.severity());
    }
}
