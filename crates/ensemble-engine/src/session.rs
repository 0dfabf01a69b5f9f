//! Fixed-timestep session driver.
//!
//! A [`Session`] owns every live game object. Each [`tick`](Session::tick):
//!
//! 1. Routes queued events: posted ones plus whatever objects emitted since
//!    the last tick. Game-object events go to every object's
//!    [`handle_event`](GameObject::handle_event) (which keeps only those
//!    addressed to it); events they trigger are routed in the same pass.
//!    Physics and view events are collected into the [`TickReport`].
//! 2. Updates every activated object in creation order.
//! 3. Routes again, so this tick's output lands in this tick's report.
//! 4. Despawns objects that announced `Destroyed`, if configured to.
//!
//! Object order is creation order and every queue is FIFO, so identical
//! inputs give identical runs.
//!
//! # Example
//!
//! ```
//! use ensemble_engine::prelude::*;
//!
//! let config = SessionConfig { fixed_dt: 1.0 / 30.0, ..Default::default() };
//! let mut session = Session::new(config, core_plugins());
//! session.run_ticks(30).unwrap();
//! assert!((session.sim_time() - 1.0).abs() < 1e-9);
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ensemble_core::adapter::{Adapter, AdapterId};
use ensemble_core::environment::Environment;
use ensemble_core::event::{Event, EventId, EventPayload, EventQueue, GameObjectEvent};
use ensemble_core::factory::PluginMap;
use ensemble_core::game_object::{GameObject, LOCATION};
use ensemble_core::handle::{GameHandle, HandleAllocator};
use ensemble_core::tree::Part;

use crate::blueprint::ObjectParameter;
use crate::EngineError;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Game-object events one routing pass may deliver. The rest are
    /// dropped.
    pub max_events_per_tick: usize,
    /// Release objects once they announce `GameObjectEvent::Destroyed`.
    pub despawn_destroyed: bool,
}

impl Default for SessionConfig {
    /// 60 Hz, 4096 events per pass, despawn on destruction.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            max_events_per_tick: 4096,
            despawn_destroyed: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics and reports
// ---------------------------------------------------------------------------

/// Timing of the last tick.
#[derive(Debug, Clone, Default)]
pub struct SessionDiagnostics {
    /// Time spent in object updates.
    pub update_time: Duration,
    /// Time spent routing events (both passes).
    pub routing_time: Duration,
    pub total_time: Duration,
}

/// What one tick produced.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Number of the tick, starting at 1.
    pub tick: u64,
    /// Physics and view events, in emission order.
    pub events: Vec<Event>,
    /// Game-object events delivered.
    pub routed: usize,
    /// Game-object events dropped over budget.
    pub dropped: usize,
    /// Objects released this tick.
    pub despawned: Vec<GameHandle>,
}

/// Names and slots remembered from a blueprint.
#[derive(Debug)]
struct SpawnRecord {
    name: String,
    modules: BTreeMap<String, GameHandle>,
    root_adapters: Vec<Adapter>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Owner of all game objects in one simulation.
pub struct Session {
    config: SessionConfig,
    environment: Environment,
    plugins: Rc<PluginMap>,
    allocator: HandleAllocator,
    /// Creation order.
    objects: Vec<Rc<RefCell<GameObject>>>,
    records: BTreeMap<GameHandle, SpawnRecord>,
    inbound: EventQueue,
    tick_counter: u64,
    last_diagnostics: SessionDiagnostics,
}

impl Session {
    /// Create an empty session.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is not positive and finite.
    pub fn new(config: SessionConfig, plugins: PluginMap) -> Self {
        assert!(
            config.fixed_dt > 0.0 && config.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            config.fixed_dt
        );
        Self {
            config,
            environment: Environment::new(),
            plugins: Rc::new(plugins),
            allocator: HandleAllocator::new(),
            objects: Vec::new(),
            records: BTreeMap::new(),
            inbound: EventQueue::new(),
            tick_counter: 0,
            last_diagnostics: SessionDiagnostics::default(),
        }
    }

    // -- objects --------------------------------------------------------------

    /// Build a live object from `blueprint`.
    ///
    /// The root module receives the object's handle; every other module gets
    /// a fresh one. Object values and the initial location are set first,
    /// then the root is attached, then each connection in order, then the
    /// virtual modules. A Reinitialize event is queued so the first tick
    /// announces the object's poses.
    ///
    /// On error nothing is kept.
    pub fn spawn(&mut self, blueprint: &ObjectParameter) -> Result<GameHandle, EngineError> {
        blueprint.validate()?;

        let handle = self.allocator.allocate();
        let mut modules = BTreeMap::new();
        for module in &blueprint.modules {
            let module_handle = if module.name == blueprint.root {
                handle
            } else {
                self.allocator.allocate()
            };
            modules.insert(module.name.clone(), module_handle);
        }
        let lookup = |name: &str| {
            modules
                .get(name)
                .copied()
                .ok_or_else(|| EngineError::UnknownModule {
                    object: blueprint.name.clone(),
                    module: name.to_owned(),
                })
        };
        let parameter = |name: &str| {
            blueprint
                .module(name)
                .ok_or_else(|| EngineError::UnknownModule {
                    object: blueprint.name.clone(),
                    module: name.to_owned(),
                })
        };

        let object = GameObject::new(handle, &self.environment, Rc::clone(&self.plugins));
        let root = parameter(&blueprint.root)?;
        let root_adapters = root.adapters();
        {
            let mut go = object.borrow_mut();
            for value in &blueprint.values {
                go.set_value(value.id(), value.value.clone())?;
            }
            if let Some(location) = blueprint.location {
                go.set_value(LOCATION, location)?;
            }

            go.attach_module(
                root.to_module(handle).into(),
                &root_adapters,
                0,
                GameHandle::NULL,
                0,
            )?;
            for connection in &blueprint.connections {
                let child = parameter(&connection.child)?;
                go.attach_module(
                    child.to_module(lookup(&connection.child)?).into(),
                    &child.adapters(),
                    connection.child_adapter,
                    lookup(&connection.parent)?,
                    connection.parent_adapter,
                )?;
            }
            for module in blueprint.modules.iter().filter(|m| m.is_virtual) {
                go.attach_virtual_module(module.to_module(lookup(&module.name)?))?;
            }
            go.set_activated(blueprint.activated);
        }

        self.inbound.emit(
            GameObjectEvent::Reinitialize,
            EventPayload::None,
            handle,
            GameHandle::NULL,
        );
        self.objects.push(object);
        self.records.insert(
            handle,
            SpawnRecord {
                name: blueprint.name.clone(),
                modules,
                root_adapters,
            },
        );
        debug!(object = %handle, name = %blueprint.name, "spawned");
        Ok(handle)
    }

    /// Dock object `child` into `parent`: the child's root slot
    /// `child_adapter` is welded to slot `parent_adapter` of `parent_module`.
    pub fn dock(
        &mut self,
        parent: GameHandle,
        parent_module: GameHandle,
        parent_adapter: AdapterId,
        child: GameHandle,
        child_adapter: AdapterId,
    ) -> Result<(), EngineError> {
        let adapters = self
            .records
            .get(&child)
            .map(|r| r.root_adapters.clone())
            .ok_or(EngineError::UnknownObject { handle: child })?;
        let carrier = self
            .object(parent)
            .ok_or(EngineError::UnknownObject { handle: parent })?;
        carrier.borrow_mut().attach_module(
            Part::Object(child),
            &adapters,
            child_adapter,
            parent_module,
            parent_adapter,
        )?;
        Ok(())
    }

    /// Release `child` from `parent`. Returns `Ok(false)` if it was not
    /// docked there.
    pub fn undock(&mut self, parent: GameHandle, child: GameHandle) -> Result<bool, EngineError> {
        let carrier = self
            .object(parent)
            .ok_or(EngineError::UnknownObject { handle: parent })?;
        if !carrier.borrow().docked_objects().contains(&child) {
            return Ok(false);
        }
        let released = carrier.borrow_mut().detach_module(child)?;
        Ok(released)
    }

    /// Release an object. Undocks it from its carrier first. Objects docked
    /// in it are undocked at their current world pose, and the detach events
    /// go out with the next routing pass. Returns `Ok(false)` if the handle
    /// is unknown.
    pub fn destroy(&mut self, handle: GameHandle) -> Result<bool, EngineError> {
        let Some(index) = self.objects.iter().position(|o| o.borrow().handle() == handle) else {
            return Ok(false);
        };
        let carrier = self
            .objects
            .iter()
            .find(|o| o.borrow().docked_objects().contains(&handle))
            .cloned();
        if let Some(carrier) = carrier {
            carrier.borrow_mut().detach_module(handle)?;
        }

        let released = self.objects[index].borrow_mut().release_docked()?;
        for cargo in released {
            debug!(object = %handle, released = %cargo, "released cargo");
        }

        let object = self.objects.remove(index);
        self.records.remove(&handle);
        for event in object.borrow_mut().drain_events() {
            self.inbound.push(event);
        }
        drop(object);
        debug!(object = %handle, "despawned");
        Ok(true)
    }

    /// Queue an event for the next routing pass.
    pub fn post(&mut self, event: Event) {
        self.inbound.push(event);
    }

    // -- tick -----------------------------------------------------------------

    /// Advance the simulation by one fixed step.
    pub fn tick(&mut self) -> Result<TickReport, EngineError> {
        let tick_start = Instant::now();
        let mut report = TickReport {
            tick: self.tick_counter + 1,
            ..Default::default()
        };
        let mut doomed = Vec::new();

        // Phase 1: events posted or emitted since the last tick.
        let routing_start = Instant::now();
        self.route(&mut report, &mut doomed)?;
        let mut routing_time = routing_start.elapsed();

        // Phase 2: updates in creation order.
        let update_start = Instant::now();
        let dt = self.config.fixed_dt as f32;
        for object in &self.objects {
            object.borrow_mut().update(dt)?;
        }
        let update_time = update_start.elapsed();

        // Phase 3: this tick's output.
        let routing_start = Instant::now();
        self.route(&mut report, &mut doomed)?;
        routing_time += routing_start.elapsed();

        // Phase 4: despawn.
        if self.config.despawn_destroyed {
            for handle in doomed {
                if self.destroy(handle)? {
                    report.despawned.push(handle);
                }
            }
        }

        if report.dropped > 0 {
            warn!(
                tick = report.tick,
                dropped = report.dropped,
                limit = self.config.max_events_per_tick,
                "event budget exhausted"
            );
        }

        self.tick_counter += 1;
        self.last_diagnostics = SessionDiagnostics {
            update_time,
            routing_time,
            total_time: tick_start.elapsed(),
        };
        Ok(report)
    }

    /// Run `count` ticks. Returns the number of physics and view events
    /// they produced.
    pub fn run_ticks(&mut self, count: u64) -> Result<u64, EngineError> {
        let mut total_events = 0u64;
        for _ in 0..count {
            total_events += self.tick()?.events.len() as u64;
        }
        Ok(total_events)
    }

    /// Move every outbox into the inbound queue, in creation order.
    fn collect_outboxes(&mut self) {
        for object in &self.objects {
            for event in object.borrow_mut().drain_events() {
                self.inbound.push(event);
            }
        }
    }

    fn route(
        &mut self,
        report: &mut TickReport,
        doomed: &mut Vec<GameHandle>,
    ) -> Result<(), EngineError> {
        self.collect_outboxes();
        let mut budget = self.config.max_events_per_tick;

        while let Some(event) = self.inbound.pop() {
            if !event.id.targets_objects() {
                report.events.push(event);
                continue;
            }
            if budget == 0 {
                report.dropped += 1;
                continue;
            }
            budget -= 1;
            report.routed += 1;

            for object in &self.objects {
                object.borrow_mut().handle_event(&event)?;
            }
            if event.id == EventId::GameObject(GameObjectEvent::Destroyed)
                && !doomed.contains(&event.destination)
            {
                doomed.push(event.destination);
            }
            self.collect_outboxes();
        }
        Ok(())
    }

    // -- accessors ------------------------------------------------------------

    pub fn object(&self, handle: GameHandle) -> Option<Rc<RefCell<GameObject>>> {
        self.objects
            .iter()
            .find(|o| o.borrow().handle() == handle)
            .cloned()
    }

    /// Live objects in creation order.
    pub fn objects(&self) -> impl Iterator<Item = &Rc<RefCell<GameObject>>> {
        self.objects.iter()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn plugins(&self) -> &PluginMap {
        &self.plugins
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle given to module `name` of `object` at spawn.
    pub fn module_handle(&self, object: GameHandle, name: &str) -> Option<GameHandle> {
        self.records.get(&object)?.modules.get(name).copied()
    }

    /// Blueprint name of `object`.
    pub fn object_name(&self, object: GameHandle) -> Option<&str> {
        self.records.get(&object).map(|r| r.name.as_str())
    }

    /// First live object spawned from a blueprint called `name`.
    pub fn find_by_name(&self, name: &str) -> Option<GameHandle> {
        self.records
            .iter()
            .find(|(_, r)| r.name == name)
            .map(|(&handle, _)| handle)
    }

    /// The number of ticks executed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// `tick_count * fixed_dt`, computed rather than accumulated.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.config.fixed_dt
    }

    pub fn fixed_dt(&self) -> f64 {
        self.config.fixed_dt
    }

    pub fn last_diagnostics(&self) -> &SessionDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
