//! Property tests for binding symmetry.
//!
//! For any interleaving of unit churn and component lifecycle changes, every
//! bind a handle observes is matched by exactly one unbind by the time the
//! runtime stops, and no registration survives teardown.

use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use switchboard_core::{
    Component, Core, CoreConfig, DeviceHandle, Job, JobName, ProviderEvent, TypeCode, UnitUid,
};

type Balance = Arc<Mutex<HashMap<(String, String), i64>>>;

/// Handle whose bind/unbind callbacks keep a per-(handle, unit) balance:
/// +1 on bind, -1 on unbind. Symmetric teardown drives every entry to zero.
fn balanced_handle(label: &str, handle: DeviceHandle, balance: &Balance) -> DeviceHandle {
    let inc = Arc::clone(balance);
    let dec = Arc::clone(balance);
    let l1 = label.to_string();
    let l2 = label.to_string();
    handle
        .on_bind(move |_ctx, ev| {
            *inc.lock()
                .unwrap()
                .entry((l1.clone(), ev.unit.uid.to_string()))
                .or_insert(0) += 1;
            Ok(())
        })
        .on_unbind(move |_ctx, ev| {
            *dec.lock()
                .unwrap()
                .entry((l2.clone(), ev.unit.uid.to_string()))
                .or_insert(0) -= 1;
            Ok(())
        })
}

#[derive(Debug, Clone)]
enum Op {
    /// Enumerate unit `u<n>` of the matched type.
    Appear(u8),
    /// Enumerate a unit no handle matches.
    AppearForeign(u8),
    Vanish(u8),
    AllVanished,
    OpenPanel,
    ClosePanel,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..6).prop_map(Op::Appear),
        1 => (0u8..3).prop_map(Op::AppearForeign),
        3 => (0u8..6).prop_map(Op::Vanish),
        1 => Just(Op::AllVanished),
        2 => Just(Op::OpenPanel),
        2 => Just(Op::ClosePanel),
    ]
}

fn uid(n: u8) -> UnitUid {
    UnitUid::from(format!("u{}", n).as_str())
}

proptest! {
    #[test]
    fn prop_binds_and_unbinds_balance_out(ops in proptest::collection::vec(op_strategy(), 0..64)) {
        let balance: Balance = Arc::new(Mutex::new(HashMap::new()));

        let service_handle = balanced_handle(
            "all-knobs",
            DeviceHandle::multi("all-knobs", TypeCode(4)),
            &balance,
        );
        let panel_handle = balanced_handle(
            "one-knob",
            DeviceHandle::single("one-knob", TypeCode(4)),
            &balance,
        );
        let multi_id = service_handle.id().clone();
        let single_id = panel_handle.id().clone();

        let mut core = Core::new(CoreConfig::default());
        core.install(
            Job::service("svc").add_component(Component::new("c").with_handle(service_handle)),
        )
        .unwrap();
        core.install(
            Job::app("panel").add_component(Component::new("ui").with_handle(panel_handle)),
        )
        .unwrap();
        core.start().unwrap();

        for op in &ops {
            match op {
                Op::Appear(n) => core.dispatch(ProviderEvent::UnitAppeared {
                    type_code: TypeCode(4),
                    uid: uid(*n),
                    metadata: json!({}),
                }),
                Op::AppearForeign(n) => core.dispatch(ProviderEvent::UnitAppeared {
                    type_code: TypeCode(9),
                    uid: UnitUid::from(format!("f{}", n).as_str()),
                    metadata: json!({}),
                }),
                Op::Vanish(n) => core.dispatch(ProviderEvent::UnitVanished { uid: uid(*n) }),
                Op::AllVanished => core.dispatch(ProviderEvent::AllVanished),
                Op::OpenPanel => core.activate(&JobName::from("panel")).unwrap(),
                Op::ClosePanel => core.deactivate(&JobName::from("panel")).unwrap(),
            }

            // At most one unit ever occupies the single-arity slot.
            if let Some(bound) = core.bound_units(&single_id) {
                prop_assert!(bound.len() <= 1);
            }
        }

        core.stop().unwrap();

        // Symmetry: every bind was matched by exactly one unbind.
        for ((handle, unit), delta) in balance.lock().unwrap().iter() {
            prop_assert_eq!(
                *delta, 0,
                "handle '{}' leaked a binding for unit '{}'", handle, unit
            );
        }
        prop_assert_eq!(core.binding_stats().binds, core.binding_stats().unbinds);

        // No orphan registrations after teardown.
        prop_assert_eq!(core.bound_units(&multi_id), None);
        prop_assert_eq!(core.bound_units(&single_id), None);
        prop_assert_eq!(core.bus_stats().subscriptions, 0);
        prop_assert!(core.units().is_empty());
    }
}
