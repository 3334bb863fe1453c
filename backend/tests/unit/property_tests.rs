//! Property-based tests for runtime-value persistence, quantity parsing and
//! port leasing.

#![allow(clippy::expect_used)]

use std::collections::BTreeSet;

use proptest::prelude::*;

use berth_backend::application::ports::PortAllocator;
use berth_backend::application::services::port_allocator::MemoryPortAllocator;
use berth_backend::domain::RuntimeValue;
use berth_backend::domain::runtime_value::keys;
use berth_backend::domain::spec::{parse_cpu_millis, parse_memory};

// ============================================================================
// Runtime values survive metadata persistence
// ============================================================================

proptest! {
    /// Any string, including separators and quotes, reads back unchanged.
    #[test]
    fn prop_string_value_reads_back(raw in ".{0,64}") {
        let rv = RuntimeValue::new(keys::DISPLAY_NAME, raw.clone()).expect("string kind");
        let back = RuntimeValue::deserialize(keys::DISPLAY_NAME, &rv.serialize())
            .expect("parses back");
        prop_assert_eq!(back.value(), rv.value());
    }

    #[test]
    fn prop_integer_value_reads_back(n in any::<i64>()) {
        let rv = RuntimeValue::new(keys::HEARTBEAT_TIMEOUT, n).expect("integer kind");
        let back = RuntimeValue::deserialize(keys::HEARTBEAT_TIMEOUT, &rv.serialize())
            .expect("parses back");
        prop_assert_eq!(back.value(), rv.value());
    }

    /// Group names containing commas or quotes keep their boundaries.
    #[test]
    fn prop_string_list_keeps_boundaries(groups in prop::collection::vec("[a-z,\" ]{0,12}", 0..6)) {
        let rv = RuntimeValue::new(keys::USER_GROUPS, groups.clone()).expect("list kind");
        let back = RuntimeValue::deserialize(keys::USER_GROUPS, &rv.serialize())
            .expect("parses back");
        prop_assert_eq!(back.value(), rv.value());
    }
}

// ============================================================================
// Quantity parsing
// ============================================================================

proptest! {
    #[test]
    fn prop_mebibytes_scale(n in 0i64..1_000_000) {
        prop_assert_eq!(parse_memory(&format!("{n}m")).expect("valid"), n << 20);
        prop_assert_eq!(parse_memory(&format!("{n}Mi")).expect("valid"), n << 20);
    }

    #[test]
    fn prop_millicores_pass_through(n in 0i64..1_000_000) {
        prop_assert_eq!(parse_cpu_millis(&format!("{n}m")).expect("valid"), n);
        prop_assert_eq!(parse_cpu_millis(&n.to_string()).expect("valid"), n * 1000);
    }

    #[test]
    fn prop_garbage_quantities_rejected(unit in "[a-z&&[^bkmgti]]{1,3}") {
        let quantity = format!("12{unit}");
        prop_assert!(parse_memory(&quantity).is_err());
    }
}

// ============================================================================
// Port leasing
// ============================================================================

proptest! {
    /// Leases within one range never collide, whatever the owners.
    #[test]
    fn prop_allocations_are_distinct(owners in prop::collection::vec("[a-z0-9]{1,8}", 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let ports = rt.block_on(async {
            let allocator = MemoryPortAllocator::new();
            let mut ports = Vec::new();
            for owner in &owners {
                ports.push(allocator.allocate(20000, 21000, owner).await.expect("free port"));
            }
            ports
        });
        let distinct: BTreeSet<u16> = ports.iter().copied().collect();
        prop_assert_eq!(distinct.len(), ports.len());
        prop_assert!(ports.iter().all(|p| (20000..=21000).contains(p)));
    }
}
