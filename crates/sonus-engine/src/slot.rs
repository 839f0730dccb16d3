//! Auxiliary effect-slot routing graph (component J, spec §4.J): each
//! slot has an input buffer filled by voice sends, an opaque effect
//! instance, and a gain; slots may feed the dry mix or one other slot,
//! and the graph they form must stay acyclic.

use std::collections::{HashMap, HashSet, VecDeque};

use sonus_core::{Id, Registry, SonusError, SonusResult};

/// An effect implementation, opaque to the routing graph (spec §4.J:
/// "an effect instance, opaque to this spec"). Mono in, mono out —
/// sends are downmixed to mono before reaching a slot's input.
pub trait EffectInstance: Send {
    fn process(&mut self, input: &mut [f32]);
}

/// The identity effect; used for slots created without a real effect
/// assigned yet, and by tests.
pub struct Bypass;

impl EffectInstance for Bypass {
    fn process(&mut self, _input: &mut [f32]) {}
}

/// Where a slot's processed output goes once a period finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTarget {
    /// Summed into the context's dry mix at `target_channels`.
    Mix,
    /// Summed into another slot's input buffer (effect chaining).
    Slot(Id),
}

pub struct EffectSlot {
    pub gain: f32,
    pub target: SlotTarget,
    /// Dry-mix output channels this slot sums into when `target == Mix`.
    pub target_channels: Vec<usize>,
    effect: Box<dyn EffectInstance>,
    input: Vec<f32>,
}

impl EffectSlot {
    fn new(effect: Box<dyn EffectInstance>) -> Self {
        Self { gain: 1.0, target: SlotTarget::Mix, target_channels: vec![0, 1], effect, input: Vec::new() }
    }

    pub fn clear_input(&mut self, frame_count: usize) {
        self.input.clear();
        self.input.resize(frame_count, 0.0);
    }

    pub fn accumulate_input(&mut self, samples: &[f32]) {
        for (dst, src) in self.input.iter_mut().zip(samples) {
            *dst += src;
        }
    }

    /// Run the effect over this period's accumulated input in place and
    /// return the result (spec §4.J: "a slot's `process(input, frame_count)
    /// → output` is called once per period").
    fn process(&mut self) -> &[f32] {
        self.effect.process(&mut self.input);
        &self.input
    }
}

/// The DAG of effect slots for one context. Slot objects live in a
/// [`Registry`] like buffers and sources; `targets` mirrors each slot's
/// current routing target for cycle-checking and topological sort
/// without needing registry-wide iteration.
pub struct EffectGraph {
    registry: Registry<EffectSlot>,
    targets: HashMap<Id, SlotTarget>,
    order: Vec<Id>,
    dirty: bool,
}

impl EffectGraph {
    pub fn new() -> Self {
        Self { registry: Registry::new(), targets: HashMap::new(), order: Vec::new(), dirty: true }
    }

    pub fn create_slot(&mut self, effect: Box<dyn EffectInstance>) -> Id {
        let id = self.registry.insert(EffectSlot::new(effect));
        self.targets.insert(id, SlotTarget::Mix);
        self.dirty = true;
        id
    }

    pub fn remove_slot(&mut self, id: Id) -> SonusResult<()> {
        if self.registry.remove(id).is_none() {
            return Err(SonusError::InvalidName(format!("no such effect slot: {id:?}")));
        }
        self.targets.remove(&id);
        // Any slot that targeted the removed one now dangles; fall back to
        // Mix rather than silently dropping its output.
        for (&other, target) in self.targets.iter_mut() {
            if *target == SlotTarget::Slot(id) {
                *target = SlotTarget::Mix;
                self.registry.with_mut(other, |slot| slot.target = SlotTarget::Mix);
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn contains(&self, id: Id) -> bool {
        self.registry.contains(id)
    }

    pub fn with_mut<R>(&self, id: Id, f: impl FnOnce(&mut EffectSlot) -> R) -> Option<R> {
        self.registry.with_mut(id, f)
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.targets.keys().copied()
    }

    /// `from`'s routing is being redirected to `to`; rejected if that
    /// would make `from` reachable again from `to` (spec §4.J: "creation
    /// of a send that would form a cycle is rejected").
    fn would_create_cycle(&self, from: Id, to: Id) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![to];
        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if visited.insert(current) {
                if let Some(SlotTarget::Slot(next)) = self.targets.get(&current).copied() {
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Set `id`'s target, rejecting a change that would create a cycle.
    pub fn set_target(&mut self, id: Id, target: SlotTarget) -> SonusResult<()> {
        if !self.targets.contains_key(&id) {
            return Err(SonusError::InvalidName(format!("no such effect slot: {id:?}")));
        }
        if let SlotTarget::Slot(to) = target {
            if !self.targets.contains_key(&to) {
                return Err(SonusError::InvalidName(format!("no such effect slot: {to:?}")));
            }
            if to == id || self.would_create_cycle(id, to) {
                return Err(SonusError::InvalidOperation(
                    "effect slot routing change would create a cycle".into(),
                ));
            }
        }
        self.targets.insert(id, target);
        self.registry.with_mut(id, |slot| slot.target = target);
        self.dirty = true;
        Ok(())
    }

    /// Recompute the topological processing order via Kahn's algorithm.
    /// A no-op when nothing has changed since the last call.
    fn update_processing_order(&mut self) {
        if !self.dirty {
            return;
        }
        let mut in_degree: HashMap<Id, usize> = self.targets.keys().map(|&id| (id, 0)).collect();
        for &target in self.targets.values() {
            if let SlotTarget::Slot(to) = target {
                *in_degree.entry(to).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<Id> = in_degree.iter().filter(|&(_, &d)| d == 0).map(|(&id, _)| id).collect();
        let mut order = Vec::with_capacity(self.targets.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(SlotTarget::Slot(to)) = self.targets.get(&id).copied() {
                if let Some(deg) = in_degree.get_mut(&to) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(to);
                    }
                }
            }
        }

        self.order = order;
        self.dirty = false;
    }

    /// Clear every slot's input buffer ahead of this period's voice sends
    /// (spec §4.H step 2).
    pub fn clear_inputs(&mut self, frame_count: usize) {
        let ids: Vec<Id> = self.ids().collect();
        for id in ids {
            self.registry.with_mut(id, |slot| slot.clear_input(frame_count));
        }
    }

    /// Process every slot in topological order, summing chained slot
    /// outputs forward and accumulating `Mix`-targeted output into
    /// `dry_mix` (spec §4.H step 4).
    pub fn process_all(&mut self, dry_mix: &mut [Vec<f32>]) {
        self.update_processing_order();
        let order = self.order.clone();
        for id in order {
            let Some((target, gain, target_channels, output)) = self.registry.with_mut(id, |slot| {
                let output = slot.process().to_vec();
                (slot.target, slot.gain, slot.target_channels.clone(), output)
            }) else {
                continue;
            };
            match target {
                SlotTarget::Mix => {
                    for &ch in &target_channels {
                        if let Some(accum) = dry_mix.get_mut(ch) {
                            for (dst, &src) in accum.iter_mut().zip(&output) {
                                *dst += src * gain;
                            }
                        }
                    }
                }
                SlotTarget::Slot(next) => {
                    let scaled: Vec<f32> = output.iter().map(|&s| s * gain).collect();
                    self.registry.with_mut(next, |next_slot| next_slot.accumulate_input(&scaled));
                }
            }
        }
    }
}

impl Default for EffectGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_self_target_is_rejected() {
        let mut graph = EffectGraph::new();
        let a = graph.create_slot(Box::new(Bypass));
        assert!(graph.set_target(a, SlotTarget::Slot(a)).is_err());
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let mut graph = EffectGraph::new();
        let a = graph.create_slot(Box::new(Bypass));
        let b = graph.create_slot(Box::new(Bypass));
        let c = graph.create_slot(Box::new(Bypass));
        graph.set_target(a, SlotTarget::Slot(b)).unwrap();
        graph.set_target(b, SlotTarget::Slot(c)).unwrap();
        assert!(graph.set_target(c, SlotTarget::Slot(a)).is_err());
    }

    #[test]
    fn topological_order_processes_upstream_slots_first() {
        let mut graph = EffectGraph::new();
        let a = graph.create_slot(Box::new(Bypass));
        let b = graph.create_slot(Box::new(Bypass));
        graph.set_target(a, SlotTarget::Slot(b)).unwrap();
        graph.update_processing_order();
        let pos_a = graph.order.iter().position(|&id| id == a).unwrap();
        let pos_b = graph.order.iter().position(|&id| id == b).unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn chained_slot_output_reaches_the_dry_mix() {
        struct Gain2x;
        impl EffectInstance for Gain2x {
            fn process(&mut self, input: &mut [f32]) {
                for s in input.iter_mut() {
                    *s *= 2.0;
                }
            }
        }

        let mut graph = EffectGraph::new();
        let a = graph.create_slot(Box::new(Gain2x));
        let b = graph.create_slot(Box::new(Gain2x));
        graph.set_target(a, SlotTarget::Slot(b)).unwrap();
        graph.with_mut(b, |slot| slot.target_channels = vec![0]);

        graph.clear_inputs(4);
        graph.with_mut(a, |slot| slot.accumulate_input(&[1.0, 1.0, 1.0, 1.0]));

        let mut dry_mix = vec![vec![0.0f32; 4]];
        graph.process_all(&mut dry_mix);
        // a doubles to 2.0, feeds b which doubles again to 4.0.
        assert!(dry_mix[0].iter().all(|&s| (s - 4.0).abs() < 1e-6));
    }

    #[test]
    fn removing_a_slot_falls_back_targets_to_mix() {
        let mut graph = EffectGraph::new();
        let a = graph.create_slot(Box::new(Bypass));
        let b = graph.create_slot(Box::new(Bypass));
        graph.set_target(a, SlotTarget::Slot(b)).unwrap();
        graph.remove_slot(b).unwrap();
        assert_eq!(graph.targets.get(&a).copied(), Some(SlotTarget::Mix));
    }
}
