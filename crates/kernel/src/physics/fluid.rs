use glam::DVec3;
use tracing::trace;

use crate::config::FluidConfig;
use crate::entity::Entity;
use crate::events::{EventSink, GameEventKind, KernelEvent, ParticleKind, SoundKind};
use crate::math::{cells_between, Aabb};
use crate::world::{BlockGetter, FluidKind};

const SAMPLE_DEFLATE: f64 = 0.001;
const BUOYANCY_LIFT: f64 = 5.0e-4;
const BUOYANCY_MAX_RISE: f64 = 0.06;

/// Fluid found under one bounding box.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FluidSample {
    /// Deepest submersion measured from the box bottom, at most the box height.
    pub height: f64,
    pub touching: bool,
    /// Sum of the sampled flow vectors, already weighted for shallow cells.
    pub flow_sum: DVec3,
    pub flow_samples: u32,
}

impl FluidSample {
    fn averaged_flow(&self) -> DVec3 {
        if self.flow_samples == 0 {
            self.flow_sum
        } else {
            self.flow_sum / f64::from(self.flow_samples)
        }
    }
}

/// Samples fluid height and flow around an entity, applies drift and
/// buoyancy, and keeps the entity's "in fluid" state current.
#[derive(Debug, Clone, Copy)]
pub struct FluidInteractionModel<'a> {
    config: &'a FluidConfig,
}

impl<'a> FluidInteractionModel<'a> {
    pub fn new(config: &'a FluidConfig) -> Self {
        Self { config }
    }

    pub fn flow_scale(&self, kind: FluidKind) -> f64 {
        match kind {
            FluidKind::Water => self.config.water_flow_scale,
            FluidKind::Lava => self.config.lava_flow_scale,
        }
    }

    /// Pure measurement of `kind` inside `bbox`. Returns `None` when the box
    /// reaches into cells that are not loaded.
    pub fn measure<B: BlockGetter + ?Sized>(
        &self,
        level: &B,
        bbox: &Aabb,
        kind: FluidKind,
        collect_flow: bool,
    ) -> Option<FluidSample> {
        let sampled = bbox.deflate(SAMPLE_DEFLATE);
        let (min, max) = sampled.block_range();
        if !level.is_loaded(min) || !level.is_loaded(max) {
            return None;
        }

        let mut sample = FluidSample::default();
        for pos in cells_between(min, max) {
            let fluid = level.fluid_state(pos);
            if !fluid.is(kind) {
                continue;
            }
            let top = f64::from(pos.y) + fluid.height(level, pos);
            if top < sampled.min.y {
                continue;
            }
            sample.touching = true;
            sample.height = sample.height.max(top - sampled.min.y).min(bbox.height());
            if collect_flow {
                let mut flow = fluid.flow();
                if sample.height < self.config.partial_submersion {
                    flow *= sample.height;
                }
                sample.flow_sum += flow;
                sample.flow_samples += 1;
            }
        }
        Some(sample)
    }

    /// Measures `kind` under the entity, stores the submersion height and
    /// pushes the entity along the averaged flow scaled by `flow_scale`.
    pub fn sample<B: BlockGetter + ?Sized>(
        &self,
        entity: &mut Entity,
        level: &B,
        kind: FluidKind,
        flow_scale: f64,
    ) -> FluidSample {
        let pushed = entity.profile.fluid.pushed_by_fluid;
        let Some(sample) = self.measure(level, &entity.bounding_box(), kind, pushed) else {
            trace!(entity = %entity.id, ?kind, "fluid_sample_unloaded");
            return FluidSample::default();
        };

        let mut flow = sample.averaged_flow();
        if flow.length_squared() > 0.0 {
            if !entity.profile.fluid.precise_flow {
                flow = flow.normalize_or_zero();
            }
            flow *= flow_scale;
            let velocity = entity.velocity();
            if velocity.x.abs() < self.config.min_velocity_threshold
                && velocity.z.abs() < self.config.min_velocity_threshold
                && flow.length() < self.config.min_impulse
            {
                flow = flow.normalize_or_zero() * self.config.min_impulse;
            }
            entity.add_velocity(flow);
        }
        entity.fluid_heights.insert(kind, sample.height);
        sample
    }

    /// Per-tick fluid update. Returns whether the entity is in any liquid.
    pub fn update<B: BlockGetter + ?Sized>(
        &self,
        entity: &mut Entity,
        level: &B,
        events: &mut dyn EventSink,
    ) -> bool {
        entity.fluid_heights.clear();

        let water = self.sample(entity, level, FluidKind::Water, self.flow_scale(FluidKind::Water));
        if water.touching {
            if !entity.was_touching_water && !entity.first_tick {
                splash(entity, events);
            }
            entity.reset_fall_distance();
            entity.extinguish();
            entity.was_touching_water = true;
        } else {
            entity.was_touching_water = false;
        }

        let lava = self.sample(entity, level, FluidKind::Lava, self.flow_scale(FluidKind::Lava));
        entity.was_in_lava = lava.touching;

        if water.touching && water.height > self.config.buoyancy_threshold {
            self.apply_buoyancy(entity, water.height);
        }
        entity.is_in_liquid()
    }

    /// Lift proportional to the submerged fraction; fully submerged bodies
    /// rise slowly until they reach the surface.
    fn apply_buoyancy(&self, entity: &mut Entity, height: f64) {
        if entity.is_no_physics() || entity.on_ground {
            return;
        }
        let velocity = entity.velocity();
        if velocity.y >= BUOYANCY_MAX_RISE {
            return;
        }
        let fraction = (height / entity.dimensions().height).clamp(0.0, 1.0);
        let lift = entity.profile.physics.gravity / 16.0 * fraction + BUOYANCY_LIFT;
        entity.add_velocity(DVec3::new(0.0, lift, 0.0));
    }
}

fn splash(entity: &Entity, events: &mut dyn EventSink) {
    let position = entity.position();
    let count = 1 + (entity.dimensions().width * 20.0) as u32;
    events.emit(KernelEvent::Sound {
        sound: SoundKind::Splash,
        position,
    });
    events.emit(KernelEvent::Particle {
        particle: ParticleKind::Bubble,
        position,
        count,
    });
    events.emit(KernelEvent::Particle {
        particle: ParticleKind::Splash,
        position,
        count,
    });
    events.emit(KernelEvent::GameEvent {
        kind: GameEventKind::Splash,
        entity: entity.id,
        position,
    });
}

#[cfg(test)]
mod tests {
    use glam::IVec3;

    use super::*;
    use crate::entity::testing::{entity_with, test_entity, test_profile};
    use crate::entity::{EntityId, FluidProfile};
    use crate::world::{BlockRegistry, FluidState, GridLevel};

    fn pool(depth: i32) -> GridLevel {
        let mut level = GridLevel::new(BlockRegistry::default());
        level
            .fill_fluid(
                IVec3::new(-2, 0, -2),
                IVec3::new(2, depth - 1, 2),
                FluidState::source(FluidKind::Water),
            )
            .expect("pool");
        level
    }

    #[test]
    fn fully_submerged_box_reports_its_height() {
        let level = pool(4);
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 0.5, 0.5));

        let sample = model.sample(&mut entity, &level, FluidKind::Water, 0.014);

        assert!(sample.touching);
        assert!((sample.height - 1.8).abs() < 1e-9, "height {}", sample.height);
        assert!((entity.fluid_height(FluidKind::Water) - 1.8).abs() < 1e-9);
        assert_eq!(entity.velocity(), DVec3::ZERO);
    }

    #[test]
    fn shallow_source_submerges_partially() {
        let level = pool(1);
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 0.0, 0.5));

        let sample = model.sample(&mut entity, &level, FluidKind::Water, 0.014);

        assert!(sample.touching);
        assert!((sample.height - (8.0 / 9.0 - 0.001)).abs() < 1e-9);
    }

    #[test]
    fn dry_box_above_surface_is_not_touching() {
        let level = pool(1);
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 1.5, 0.5));

        let sample = model.sample(&mut entity, &level, FluidKind::Water, 0.014);
        assert!(!sample.touching);
        assert_eq!(sample.height, 0.0);
    }

    #[test]
    fn flowing_water_pushes_along_normalized_flow() {
        let mut level = GridLevel::new(BlockRegistry::default());
        level
            .fill_fluid(
                IVec3::new(-2, 0, -2),
                IVec3::new(2, 0, 2),
                FluidState::flowing(FluidKind::Water, 8, DVec3::new(3.0, 0.0, 0.0)),
            )
            .expect("channel");
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 0.0, 0.5));

        model.sample(&mut entity, &level, FluidKind::Water, config.water_flow_scale);

        assert!((entity.velocity().x - 0.014).abs() < 1e-12);
        assert_eq!(entity.velocity().z, 0.0);
    }

    #[test]
    fn weak_precise_flow_is_raised_to_minimum_impulse() {
        let mut level = GridLevel::new(BlockRegistry::default());
        level.set_fluid(
            IVec3::ZERO,
            FluidState::flowing(FluidKind::Water, 8, DVec3::new(0.0, 0.0, 0.1)),
        );
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let profile = test_profile().with_fluid(FluidProfile {
            pushed_by_fluid: true,
            precise_flow: true,
        });
        let mut entity = entity_with(EntityId(4), profile, DVec3::new(0.5, 0.0, 0.5));

        model.sample(&mut entity, &level, FluidKind::Water, config.water_flow_scale);

        assert!((entity.velocity().z - config.min_impulse).abs() < 1e-12);
    }

    #[test]
    fn unloaded_cells_count_as_dry() {
        let mut level = pool(4);
        level.set_loaded_region(Some((IVec3::new(10, 0, 10), IVec3::new(20, 10, 20))));
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 0.5, 0.5));

        let sample = model.sample(&mut entity, &level, FluidKind::Water, 0.014);
        assert!(!sample.touching);
    }

    #[test]
    fn first_water_contact_splashes_and_resets_fall() {
        let level = pool(2);
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 0.5, 0.5));
        entity.first_tick = false;
        entity.fall_distance = 5.0;
        entity.ignite_for_ticks(40);
        let mut events = Vec::new();

        assert!(model.update(&mut entity, &level, &mut events));
        assert!(entity.is_in_water());
        assert_eq!(entity.fall_distance(), 0.0);
        assert_eq!(entity.remaining_fire_ticks(), 0);
        assert!(events.contains(&KernelEvent::Sound {
            sound: SoundKind::Splash,
            position: entity.position(),
        }));

        events.clear();
        model.update(&mut entity, &level, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn submerged_entity_gets_lift() {
        let level = pool(4);
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 1.0, 0.5));
        let mut events = Vec::new();

        model.update(&mut entity, &level, &mut events);
        assert!(entity.velocity().y > 0.0);
    }

    #[test]
    fn lava_contact_sets_lava_state() {
        let mut level = GridLevel::new(BlockRegistry::default());
        level.set_fluid(IVec3::ZERO, FluidState::source(FluidKind::Lava));
        let config = FluidConfig::default();
        let model = FluidInteractionModel::new(&config);
        let mut entity = test_entity(DVec3::new(0.5, 0.0, 0.5));
        let mut events = Vec::new();

        assert!(model.update(&mut entity, &level, &mut events));
        assert!(entity.is_in_lava());
        assert!(!entity.is_in_water());
        assert!(entity.fluid_height(FluidKind::Lava) > 0.0);
    }
}
