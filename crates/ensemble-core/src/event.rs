//! Events exchanged between game objects, their concepts, and the external
//! physics / view collaborators.
//!
//! The core never delivers an event across objects by itself. Everything a
//! concept emits lands in its owner's outbound [`EventQueue`]; the session
//! driver drains those queues in FIFO order and routes each event either to
//! game objects ([`GameObject::handle_event`](crate::game_object::GameObject::handle_event))
//! or to the external collaborators.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::handle::GameHandle;
use crate::value::{Location, Quat, ValueId, Vec3};

// ---------------------------------------------------------------------------
// Event ids
// ---------------------------------------------------------------------------

/// Events addressed to game objects and their concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GameObjectEvent {
    /// An object-wide value changed. Payload: [`EventPayload::Value`].
    ValueUpdated,
    /// Reset to the authored state. Also re-emits the object's pose to
    /// physics and broadcasts [`ActionId::MAGIC_STOP`] to every concept.
    Reinitialize,
    /// Detach the destination module from its owner.
    DetachModule,
    /// A controller action. Payload: [`EventPayload::Action`].
    Control,
    /// The object decided it is destroyed; the driver may remove it.
    Destroyed,
}

/// Events exchanged with the physics collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PhysicsEvent {
    UpdatePosition,
    UpdateOrientation,
    UpdateVelocity,
    UpdateModulePosition,
    UpdateModuleOrientation,
    AttachObject,
    DetachObject,
    /// Inbound: a contact involving the destination.
    Contact,
    /// Inbound: authoritative pose of the destination.
    FullSync,
}

/// Events sent to the view collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViewEvent {
    AttachObject,
    DetachObject,
    UpdatePosition,
    UpdateOrientation,
    SetVisible,
}

/// Identifier of an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventId {
    GameObject(GameObjectEvent),
    Physics(PhysicsEvent),
    View(ViewEvent),
    /// Application-defined event number.
    Custom(u32),
}

impl EventId {
    /// Whether this event is meant for game objects (as opposed to the
    /// physics or view collaborators).
    pub fn targets_objects(self) -> bool {
        match self {
            EventId::GameObject(_) | EventId::Custom(_) => true,
            EventId::Physics(PhysicsEvent::Contact | PhysicsEvent::FullSync) => true,
            EventId::Physics(_) | EventId::View(_) => false,
        }
    }
}

impl From<GameObjectEvent> for EventId {
    fn from(e: GameObjectEvent) -> Self {
        EventId::GameObject(e)
    }
}

impl From<PhysicsEvent> for EventId {
    fn from(e: PhysicsEvent) -> Self {
        EventId::Physics(e)
    }
}

impl From<ViewEvent> for EventId {
    fn from(e: ViewEvent) -> Self {
        EventId::View(e)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Identifier of a controller action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub u32);

impl ActionId {
    /// Stop everything now. Broadcast on reinitialize.
    pub const MAGIC_STOP: ActionId = ActionId(0);
    pub const THRUST: ActionId = ActionId(1);
    pub const TURN: ActionId = ActionId(2);
}

/// Data carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    None,
    Value(ValueId),
    Position(Vec3),
    Orientation(Quat),
    Velocity(Vec3),
    Location(Location),
    /// Spatial parenting: `child` is attached under `parent` at `offset`.
    Attach {
        parent: GameHandle,
        child: GameHandle,
        offset: Location,
    },
    Handle(GameHandle),
    Action {
        action: ActionId,
        value: f32,
    },
    Contact {
        other: GameHandle,
        impulse: f32,
    },
    Visible(bool),
    Custom(serde_json::Value),
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One event in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub payload: EventPayload,
    /// Object or module the event is about.
    pub destination: GameHandle,
    pub sender: GameHandle,
}

impl Event {
    pub fn new(
        id: impl Into<EventId>,
        payload: EventPayload,
        destination: GameHandle,
        sender: GameHandle,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            destination,
            sender,
        }
    }
}

// ---------------------------------------------------------------------------
// EventQueue
// ---------------------------------------------------------------------------

/// FIFO queue of events waiting to be routed.
#[derive(Debug, Default, Clone)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event.
    pub fn emit(
        &mut self,
        id: impl Into<EventId>,
        payload: EventPayload,
        destination: GameHandle,
        sender: GameHandle,
    ) {
        self.push(Event::new(id, payload, destination, sender));
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Take every queued event, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}
