use proptest::prelude::*;
use satcom_bridge::config::DeliveryDeadlineConfig;
use satcom_bridge::correlation::{CorrelationIndex, CorrelationKey};
use satcom_bridge::models::{AckStatus, DesiredProperty, InstanceId, PropertyState, ShadowPatch};
use satcom_bridge::reconciler::{classify, PropertyDecision};
use satcom_bridge::timeout::{compute_delivery_deadline, grace_time};
use serde_json::{json, Value};
use std::time::Duration;

fn ack_strategy() -> impl Strategy<Value = AckStatus> {
    prop_oneof![
        Just(AckStatus::Ok),
        Just(AckStatus::Pending),
        Just(AckStatus::Rejected),
        Just(AckStatus::TimedOut),
        Just(AckStatus::Error),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        (0u32..5).prop_map(Value::from),
        "[a-z]{1,8}".prop_map(Value::from),
    ]
}

proptest! {
    /// Property: a larger payload never shortens the delivery wait
    #[test]
    fn grace_grows_with_message_size(small in 0usize..20_000, extra in 0usize..20_000) {
        let config = DeliveryDeadlineConfig::default();
        let smaller = grace_time(&config, Some(small));
        let larger = grace_time(&config, Some(small + extra));
        prop_assert!(larger >= smaller);
        prop_assert!(smaller >= Duration::from_secs(config.grace_seconds));
    }

    /// Property: without a scheduled send time the wait is base timeout plus grace
    #[test]
    fn unscheduled_deadline_is_base_plus_grace(size in proptest::option::of(0usize..50_000)) {
        let config = DeliveryDeadlineConfig::default();
        let base = Duration::from_secs(600);
        let deadline = compute_delivery_deadline(&config, base, None, size, chrono::Utc::now());
        prop_assert_eq!(deadline, base + grace_time(&config, size));
    }

    /// Property: a reported ack older than the desired version always gets a write
    #[test]
    fn older_ack_always_writes(
        desired_version in 1u64..1_000,
        lag in 1u64..1_000,
        ack in ack_strategy(),
        desired_value in value_strategy(),
        reported_value in value_strategy(),
    ) {
        let desired = DesiredProperty { value: desired_value, version: desired_version };
        let reported = PropertyState::new(
            reported_value,
            ack,
            "",
            desired_version.saturating_sub(lag),
        );
        prop_assert_eq!(classify(&desired, Some(&reported)), PropertyDecision::Write);
    }

    /// Property: nothing acked at or after the desired version is written again
    #[test]
    fn current_ack_never_writes(
        desired_version in 0u64..1_000,
        lead in 0u64..1_000,
        ack in ack_strategy(),
        desired_value in value_strategy(),
        reported_value in value_strategy(),
    ) {
        let desired = DesiredProperty { value: desired_value, version: desired_version };
        let reported = PropertyState::new(reported_value, ack, "", desired_version + lead);
        prop_assert_ne!(classify(&desired, Some(&reported)), PropertyDecision::Write);
    }

    /// Property: a delivery key only resolves for its own message id
    #[test]
    fn delivery_keys_route_by_message_id(registered in any::<u64>(), lookup in any::<u64>()) {
        let index = CorrelationIndex::new();
        let instance_id = InstanceId::from("otaCommand-01459438SKYFEE3-0-70");
        index.register(&instance_id, CorrelationKey::delivery(registered));

        let found = index.find_by_attributes(&CorrelationKey::delivery(lookup));
        if registered == lookup {
            prop_assert_eq!(found, Some(instance_id));
        } else {
            prop_assert_eq!(found, None);
        }
    }

    /// Property: nulls never reach the twin
    #[test]
    fn patches_drop_plain_nulls(names in proptest::collection::vec("[a-zA-Z]{1,10}", 0..8)) {
        let mut patch = ShadowPatch::new();
        for (i, name) in names.iter().enumerate() {
            if i % 2 == 0 {
                patch.set_value(name.clone(), Value::Null);
            } else {
                patch.set_value(name.clone(), json!(i));
            }
        }
        let cleaned = patch.without_nulls();
        prop_assert!(cleaned.properties.values().all(|value| !value.value().is_null()));
    }
}
