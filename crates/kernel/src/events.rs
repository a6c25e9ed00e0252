use glam::DVec3;

use crate::entity::{EntityId, RemovalReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundKind {
    LeashBreak,
    LeashKnotPlace,
    Splash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEventKind {
    Step,
    HitGround,
    Splash,
    EntityMount,
    EntityDismount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleKind {
    Bubble,
    Splash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroppedItem {
    Lead,
}

/// Fire-and-forget notifications produced while ticking.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Sound {
        sound: SoundKind,
        position: DVec3,
    },
    GameEvent {
        kind: GameEventKind,
        entity: EntityId,
        position: DVec3,
    },
    Particle {
        particle: ParticleKind,
        position: DVec3,
        count: u32,
    },
    ItemDropped {
        item: DroppedItem,
        position: DVec3,
    },
    EntityRemoved {
        entity: EntityId,
        reason: RemovalReason,
    },
}

pub trait EventSink {
    fn emit(&mut self, event: KernelEvent);
}

impl EventSink for Vec<KernelEvent> {
    fn emit(&mut self, event: KernelEvent) {
        self.push(event);
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    events: Vec<KernelEvent>,
}

impl EventBus {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelEvent> {
        self.events.iter()
    }

    pub fn drain(&mut self) -> Vec<KernelEvent> {
        std::mem::take(&mut self.events)
    }
}

impl EventSink for EventBus {
    fn emit(&mut self, event: KernelEvent) {
        self.events.push(event);
    }
}
