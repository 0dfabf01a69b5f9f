//! Headless docking demo -- a carrier launches a fighter that chases a rock.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example docking_demo -p ensemble-engine
//!
//! Physics is faked: the demo integrates the velocity requests it receives
//! and feeds the result back as full-sync poses.

use std::collections::BTreeMap;

use anyhow::Context;
use tracing::info;

use ensemble_engine::concepts::SET_TARGET;
use ensemble_engine::prelude::*;

const CARRIER: &str = r#"{
    "name": "carrier",
    "root": "hull",
    "location": { "position": [0.0, 0.0, 0.0], "orientation": [0.0, 0.0, 0.0, 1.0] },
    "modules": [
        {
            "name": "hull",
            "concepts": ["PoseTracker"],
            "adapters": [{ "id": 0, "position": [2.0, 0.0, 0.0] }]
        },
        {
            "name": "hangar",
            "adapters": [
                { "id": 0, "position": [-1.0, 0.0, 0.0] },
                { "id": 1, "position": [0.0, 1.0, 0.0] }
            ]
        }
    ],
    "connections": [
        { "parent": "hull", "parent_adapter": 0, "child": "hangar", "child_adapter": 0 }
    ]
}"#;

const FIGHTER: &str = r#"{
    "name": "fighter",
    "root": "cockpit",
    "modules": [
        {
            "name": "cockpit",
            "concepts": ["PoseTracker", "ThrustControl", "AutoNavigator"],
            "values": [{ "var": 2, "plugin": 1, "value": { "Float": 6.0 } }],
            "adapters": [{ "id": 0, "position": [0.0, -0.5, 0.0] }]
        }
    ]
}"#;

const ROCK: &str = r#"{
    "name": "rock",
    "root": "core",
    "location": { "position": [20.0, 5.0, 0.0], "orientation": [0.0, 0.0, 0.0, 1.0] },
    "modules": [
        {
            "name": "core",
            "concepts": ["PoseTracker", "Destroyable"],
            "values": [{ "var": 3, "plugin": 1, "value": { "Float": 30.0 } }]
        }
    ]
}"#;

/// Stand-in physics: object poses and velocities, integrated per tick.
#[derive(Default)]
struct ToyPhysics {
    bodies: BTreeMap<GameHandle, (Location, Vec3)>,
    docked: BTreeMap<GameHandle, GameHandle>,
}

impl ToyPhysics {
    fn apply(&mut self, event: &Event) {
        let body = self.bodies.entry(event.destination).or_default();
        match event.payload {
            EventPayload::Position(p) if event.id == EventId::Physics(PhysicsEvent::UpdatePosition) => {
                body.0.position = p;
            }
            EventPayload::Orientation(q)
                if event.id == EventId::Physics(PhysicsEvent::UpdateOrientation) =>
            {
                body.0.orientation = q;
            }
            EventPayload::Velocity(v) => body.1 = v,
            EventPayload::Attach { parent, child, .. } => {
                self.docked.insert(child, parent);
            }
            EventPayload::Handle(_) if event.id == EventId::Physics(PhysicsEvent::DetachObject) => {
                self.docked.remove(&event.destination);
            }
            _ => {}
        }
    }

    /// Advance free bodies and report their poses.
    fn step(&mut self, dt: f32) -> Vec<Event> {
        let mut synced = Vec::new();
        for (&handle, (location, velocity)) in &mut self.bodies {
            if self.docked.contains_key(&handle) {
                continue;
            }
            location.position += *velocity * dt;
            synced.push(Event::new(
                PhysicsEvent::FullSync,
                EventPayload::Location(*location),
                handle,
                GameHandle::NULL,
            ));
        }
        synced
    }
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let mut session = Session::new(SessionConfig::default(), core_plugins());
    let carrier = session.spawn(&ObjectParameter::from_json(CARRIER)?)?;
    let fighter = session.spawn(&ObjectParameter::from_json(FIGHTER)?)?;
    let rock = session.spawn(&ObjectParameter::from_json(ROCK)?)?;

    let hangar = session
        .module_handle(carrier, "hangar")
        .context("carrier blueprint has a hangar")?;
    session.dock(carrier, hangar, 1, fighter, 0)?;
    info!(%carrier, %fighter, %rock, "fighter docked");

    let mut physics = ToyPhysics::default();
    let dt = session.fixed_dt() as f32;
    let mut launched = false;

    for _ in 0..600 {
        let report = session.tick()?;
        for event in &report.events {
            physics.apply(event);
        }
        for event in physics.step(dt) {
            session.post(event);
        }

        if !launched && report.tick == 30 {
            session.undock(carrier, fighter)?;
            session.post(Event::new(
                SET_TARGET,
                EventPayload::Handle(rock),
                fighter,
                GameHandle::NULL,
            ));
            launched = true;
            info!(tick = report.tick, "fighter launched");
        }

        if session.environment().exists(rock) && report.tick % 60 == 0 {
            let distance = session
                .environment()
                .go_value::<Location>(fighter, LOCATION)
                .ok()
                .zip(session.environment().go_value::<Location>(rock, LOCATION).ok())
                .map(|(a, b)| (a.position - b.position).norm());
            println!("tick {:>4}: fighter-rock distance {:?}", report.tick, distance);

            if distance.is_some_and(|d| d < 2.0) {
                session.post(Event::new(
                    PhysicsEvent::Contact,
                    EventPayload::Contact {
                        other: fighter,
                        impulse: 40.0,
                    },
                    rock,
                    fighter,
                ));
            }
        }

        for gone in &report.despawned {
            println!("tick {:>4}: object {gone} destroyed", report.tick);
        }
        if !session.environment().exists(rock) {
            break;
        }
    }

    let snapshot = session.capture_snapshot();
    println!(
        "finished after {} ticks, {} objects, state hash {}",
        snapshot.tick_counter,
        snapshot.objects.len(),
        snapshot.hash
    );
    Ok(())
}
