//! The built-in `core` concept plugin.
//!
//! | concept | reacts to | produces |
//! |---|---|---|
//! | [`ThrustControl`] | `Control` actions | `UpdateVelocity` to physics |
//! | [`Destroyable`] | physics `Contact` | `DESTROYED` value, `Destroyed` event |
//! | [`PoseTracker`] | physics `FullSync` | the object's `LOCATION` value |
//! | [`AutoNavigator`] | [`SET_TARGET`] | orientation updates, `Control` actions |
//!
//! Module variables live under [`CORE_PLUGIN_ID`].

use std::f32::consts::PI;

use tracing::debug;

use ensemble_core::concept::{Concept, ConceptContext, ConceptSetup};
use ensemble_core::environment::Environment;
use ensemble_core::event::{ActionId, Event, EventId, EventPayload, GameObjectEvent, PhysicsEvent};
use ensemble_core::factory::{Plugin, PluginMap};
use ensemble_core::game_object::LOCATION;
use ensemble_core::handle::GameHandle;
use ensemble_core::value::{Location, PluginId, Quat, ValueId, ValueType, Vec3, VarId};
use ensemble_core::CoreError;

pub const CORE_PLUGIN_ID: PluginId = PluginId(1);

/// Per-module thrust currently applied, scaled by [`MAX_THRUST`].
pub const THRUST: VarId = VarId(1);
/// Optional per-module thrust scale; 1.0 when absent.
pub const MAX_THRUST: VarId = VarId(2);
/// Per-module hit points. Required by [`Destroyable`].
pub const HEALTH: VarId = VarId(3);
/// Object-wide flag set once a [`Destroyable`] object is destroyed.
pub const DESTROYED: ValueId = ValueId::new(4, 1);

/// Point an [`AutoNavigator`] at the object in the `Handle` payload. A null
/// handle clears the target.
pub const SET_TARGET: EventId = EventId::Custom(1);

/// Distance at which an [`AutoNavigator`] stops thrusting.
pub const ARRIVAL_RADIUS: f32 = 1.0;

/// The plugin with every built-in concept.
pub fn core_plugin() -> Plugin {
    Plugin::new(CORE_PLUGIN_ID, "core")
        .with_concept("ThrustControl", ThrustControl::build)
        .with_concept("Destroyable", Destroyable::build)
        .with_concept("PoseTracker", PoseTracker::build)
        .with_concept("AutoNavigator", AutoNavigator::build)
}

/// A plugin map holding only [`core_plugin`].
pub fn core_plugins() -> PluginMap {
    PluginMap::new()
        .with_plugin(core_plugin())
        .expect("an empty plugin map accepts any plugin")
}

/// Modules a targeted event applies to: all governed modules when it names
/// the owner, the named module when this concept governs it, else none.
fn addressed_modules(ctx: &ConceptContext<'_>, destination: GameHandle) -> Vec<GameHandle> {
    let modules = ctx.modules();
    if destination == ctx.owner() {
        modules
    } else if modules.contains(&destination) {
        vec![destination]
    } else {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// ThrustControl
// ---------------------------------------------------------------------------

/// Turns control actions into a velocity request.
///
/// Each governed module pushes along its own +Z axis (relative to the root,
/// rotated into the world by `LOCATION` when known). A new velocity is sent
/// to physics whenever the sum changes.
#[derive(Debug, Default)]
pub struct ThrustControl {
    last_velocity: Option<Vec3>,
}

impl ThrustControl {
    fn build(setup: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        setup.request_event(GameObjectEvent::Control);
        Ok(Box::new(Self::default()))
    }

    /// Velocity most recently sent to physics.
    pub fn last_velocity(&self) -> Option<Vec3> {
        self.last_velocity
    }
}

impl Concept for ThrustControl {
    fn on_event(&mut self, ctx: &mut ConceptContext<'_>, event: &Event) -> Result<(), CoreError> {
        let EventPayload::Action { action, value } = event.payload else {
            return Ok(());
        };
        match action {
            ActionId::MAGIC_STOP => {
                for module in ctx.modules() {
                    *ctx.value_mut::<f32>(THRUST, module)? = 0.0;
                }
            }
            ActionId::THRUST => {
                for module in addressed_modules(ctx, event.destination) {
                    let scale = if ctx.has_value(MAX_THRUST, module) {
                        ctx.value::<f32>(MAX_THRUST, module)?
                    } else {
                        1.0
                    };
                    *ctx.value_mut::<f32>(THRUST, module)? = value.clamp(-1.0, 1.0) * scale;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut ConceptContext<'_>, _dt: f32) -> Result<(), CoreError> {
        let mut velocity = Vec3::zeros();
        for module in ctx.modules() {
            let thrust = *ctx.value_mut::<f32>(THRUST, module)?;
            if thrust == 0.0 {
                continue;
            }
            let facing = ctx
                .module_location(module)
                .map_or_else(Quat::identity, |l| l.orientation);
            velocity += facing * Vec3::z() * thrust;
        }
        if ctx.has_go_value(LOCATION) {
            velocity = ctx.go_value::<Location>(LOCATION)?.orientation * velocity;
        }

        if self.last_velocity != Some(velocity) {
            let owner = ctx.owner();
            ctx.emit(
                PhysicsEvent::UpdateVelocity,
                EventPayload::Velocity(velocity),
                owner,
            );
            self.last_velocity = Some(velocity);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Destroyable
// ---------------------------------------------------------------------------

/// Loses [`HEALTH`] on contact; destroyed when any module runs out.
#[derive(Debug, Default)]
pub struct Destroyable {
    destroyed: bool,
}

impl Destroyable {
    fn build(setup: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        setup.initvar(HEALTH);
        setup.request_event(PhysicsEvent::Contact);
        Ok(Box::new(Self::default()))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Concept for Destroyable {
    fn on_event(&mut self, ctx: &mut ConceptContext<'_>, event: &Event) -> Result<(), CoreError> {
        let EventPayload::Contact { other, impulse } = event.payload else {
            return Ok(());
        };
        if self.destroyed {
            return Ok(());
        }

        let mut lethal = false;
        for module in addressed_modules(ctx, event.destination) {
            let health = ctx.value::<f32>(HEALTH, module)? - impulse.abs();
            ctx.set_value(HEALTH, module, health)?;
            lethal |= health <= 0.0;
        }

        if lethal {
            self.destroyed = true;
            let owner = ctx.owner();
            debug!(object = %owner, by = %other, "destroyed");
            ctx.set_go_value(DESTROYED, true);
            ctx.emit(GameObjectEvent::Destroyed, EventPayload::Handle(other), owner);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PoseTracker
// ---------------------------------------------------------------------------

/// Mirrors physics full-sync poses into the object's `LOCATION` value.
#[derive(Debug, Default)]
pub struct PoseTracker;

impl PoseTracker {
    fn build(setup: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        setup.request_event(PhysicsEvent::FullSync);
        Ok(Box::new(Self))
    }
}

impl Concept for PoseTracker {
    fn on_event(&mut self, ctx: &mut ConceptContext<'_>, event: &Event) -> Result<(), CoreError> {
        if event.destination != ctx.owner() {
            return Ok(());
        }
        if let EventPayload::Location(location) = event.payload {
            ctx.set_go_value(LOCATION, location);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AutoNavigator
// ---------------------------------------------------------------------------

/// Steers toward a target object until within [`ARRIVAL_RADIUS`].
///
/// The target is dropped as soon as it no longer exists.
#[derive(Debug, Default)]
pub struct AutoNavigator {
    target: Option<GameHandle>,
    thrusting: bool,
}

impl AutoNavigator {
    fn build(setup: &mut ConceptSetup<'_>) -> Result<Box<dyn Concept>, CoreError> {
        setup.require("ThrustControl")?;
        setup.request_event(SET_TARGET);
        Ok(Box::new(Self::default()))
    }

    pub fn target(&self) -> Option<GameHandle> {
        self.target
    }

    fn set_thrust(&mut self, ctx: &mut ConceptContext<'_>, thrusting: bool) {
        if self.thrusting == thrusting {
            return;
        }
        self.thrusting = thrusting;
        let owner = ctx.owner();
        ctx.emit(
            GameObjectEvent::Control,
            EventPayload::Action {
                action: ActionId::THRUST,
                value: if thrusting { 1.0 } else { 0.0 },
            },
            owner,
        );
    }
}

fn location_of(environment: &Environment, handle: GameHandle) -> Option<Location> {
    let object = environment.get(handle)?;
    let object = object.try_borrow().ok()?;
    object.values().get(&LOCATION).and_then(Location::from_value)
}

impl Concept for AutoNavigator {
    fn on_event(&mut self, ctx: &mut ConceptContext<'_>, event: &Event) -> Result<(), CoreError> {
        if event.destination != ctx.owner() {
            return Ok(());
        }
        if let EventPayload::Handle(target) = event.payload {
            self.target = (!target.is_null()).then_some(target);
            if self.target.is_none() {
                self.set_thrust(ctx, false);
            }
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut ConceptContext<'_>, _dt: f32) -> Result<(), CoreError> {
        let Some(target) = self.target else {
            return Ok(());
        };
        if !ctx.environment().exists(target) {
            debug!(object = %ctx.owner(), target = %target, "navigation target gone");
            self.target = None;
            self.set_thrust(ctx, false);
            return Ok(());
        }
        if !ctx.has_go_value(LOCATION) {
            return Ok(());
        }
        let here = ctx.go_value::<Location>(LOCATION)?;
        let Some(there) = location_of(ctx.environment(), target) else {
            return Ok(());
        };

        let offset = there.position - here.position;
        if offset.norm() <= ARRIVAL_RADIUS {
            self.set_thrust(ctx, false);
            return Ok(());
        }
        let facing = Quat::rotation_between(&Vec3::z(), &offset)
            .unwrap_or_else(|| Quat::from_axis_angle(&Vec3::x_axis(), PI));
        let owner = ctx.owner();
        ctx.emit(
            PhysicsEvent::UpdateOrientation,
            EventPayload::Orientation(facing),
            owner,
        );
        self.set_thrust(ctx, true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
