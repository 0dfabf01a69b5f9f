//! Property tests for session determinism and docking bookkeeping.
//!
//! Random sequences of control inputs, hits, docking operations and ticks
//! are played against fresh sessions. Replaying a sequence must reproduce
//! the same snapshot, and after every step an object is flagged as docked
//! exactly when one carrier holds it.

use ensemble_engine::prelude::*;
use proptest::prelude::*;

const OBJECTS: usize = 4;

#[derive(Debug, Clone)]
enum SessionOp {
    Thrust(usize, f32),
    Hit(usize, f32),
    Dock(usize, usize),
    Undock(usize, usize),
    Reinitialize(usize),
    Tick,
}

fn session_op_strategy() -> impl Strategy<Value = SessionOp> {
    prop_oneof![
        (0..OBJECTS, -1.0f32..1.0).prop_map(|(i, v)| SessionOp::Thrust(i, v)),
        (0..OBJECTS, 0.0f32..15.0).prop_map(|(i, v)| SessionOp::Hit(i, v)),
        (0..OBJECTS, 0..OBJECTS).prop_map(|(p, c)| SessionOp::Dock(p, c)),
        (0..OBJECTS, 0..OBJECTS).prop_map(|(p, c)| SessionOp::Undock(p, c)),
        (0..OBJECTS).prop_map(SessionOp::Reinitialize),
        Just(SessionOp::Tick),
        Just(SessionOp::Tick),
    ]
}

fn drone() -> ObjectParameter {
    ObjectParameter::from_json(
        r#"{
            "name": "drone",
            "root": "hull",
            "modules": [
                {
                    "name": "hull",
                    "concepts": ["ThrustControl", "Destroyable", "PoseTracker"],
                    "values": [{ "var": 3, "plugin": 1, "value": { "Float": 20.0 } }],
                    "adapters": [{ "id": 0, "position": [0.0, 0.0, -1.0] }]
                },
                {
                    "name": "bay",
                    "adapters": [
                        { "id": 0, "position": [0.0, 0.0, 1.0] },
                        { "id": 1, "position": [1.0, 0.0, 0.0] }
                    ]
                }
            ],
            "connections": [
                { "parent": "hull", "parent_adapter": 0, "child": "bay", "child_adapter": 0 }
            ]
        }"#,
    )
    .unwrap()
}

fn docking_is_consistent(session: &Session) -> bool {
    session.objects().all(|object| {
        let object = object.borrow();
        let holders = session
            .objects()
            .filter(|carrier| carrier.borrow().docked_objects().contains(&object.handle()))
            .count();
        holders <= 1 && object.is_docked() == (holders == 1)
    })
}

/// Play `ops` and return the final snapshot. Operations the session rejects
/// (docking loops, occupied slots, despawned objects) are skipped.
fn play(ops: &[SessionOp]) -> SessionSnapshot {
    let mut session = Session::new(SessionConfig::default(), core_plugins());
    let drones: Vec<GameHandle> = (0..OBJECTS)
        .map(|_| session.spawn(&drone()).unwrap())
        .collect();

    for op in ops {
        match *op {
            SessionOp::Thrust(i, value) => session.post(Event::new(
                GameObjectEvent::Control,
                EventPayload::Action {
                    action: ActionId::THRUST,
                    value,
                },
                drones[i],
                GameHandle::NULL,
            )),
            SessionOp::Hit(i, impulse) => session.post(Event::new(
                PhysicsEvent::Contact,
                EventPayload::Contact {
                    other: GameHandle::NULL,
                    impulse,
                },
                drones[i],
                GameHandle::NULL,
            )),
            SessionOp::Dock(p, c) => {
                let bay = session.module_handle(drones[p], "bay");
                if let Some(bay) = bay {
                    let _ = session.dock(drones[p], bay, 1, drones[c], 0);
                }
            }
            SessionOp::Undock(p, c) => {
                let _ = session.undock(drones[p], drones[c]);
            }
            SessionOp::Reinitialize(i) => session.post(Event::new(
                GameObjectEvent::Reinitialize,
                EventPayload::None,
                drones[i],
                GameHandle::NULL,
            )),
            SessionOp::Tick => {
                session.tick().unwrap();
            }
        }
        assert!(docking_is_consistent(&session), "after {op:?}");
    }
    session.tick().unwrap();
    assert!(docking_is_consistent(&session));
    session.capture_snapshot()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replay_reproduces_snapshot(ops in prop::collection::vec(session_op_strategy(), 0..60)) {
        let first = play(&ops);
        let second = play(&ops);
        prop_assert_eq!(&first.hash, &second.hash);
        prop_assert_eq!(&first, &second);
        prop_assert!(first.verify().is_ok());
    }

    #[test]
    fn live_objects_match_the_environment(ops in prop::collection::vec(session_op_strategy(), 0..60)) {
        let snapshot = play(&ops);
        prop_assert!(snapshot.objects.len() <= OBJECTS);
        for object in &snapshot.objects {
            let holders = snapshot
                .objects
                .iter()
                .filter(|o| o.docked_objects.contains(&object.handle))
                .count();
            prop_assert_eq!(object.docked, holders == 1);
        }
    }
}
