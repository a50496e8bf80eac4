//! Adaptive selection among precompiled kernel variants
//!
//! Each group moves through three phases:
//!
//! - `WarmingUp`: the first valid variant is dispatched and its timing is not
//!   sampled, letting caches and clocks settle.
//! - `Exploring`: every valid variant is dispatched once, in declaration
//!   order. Variants that failed to compile are skipped.
//! - `Exploiting`: the variant with the lowest observed device time is
//!   dispatched. Completions keep refining the best time, so a faster run of
//!   the current best still wins, but abandoned variants are never resampled.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{ShimError, ShimResult};

pub type VariantGroupId = u64;

/// One precompiled alternative
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    pub label: String,
    /// Kernel handle value, `None` when the variant failed to compile
    pub kernel: Option<usize>,
}

impl VariantSpec {
    pub fn new(label: impl Into<String>, kernel: usize) -> Self {
        VariantSpec {
            label: label.into(),
            kernel: Some(kernel),
        }
    }

    pub fn failed(label: impl Into<String>) -> Self {
        VariantSpec {
            label: label.into(),
            kernel: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kernel.is_some()
    }
}

/// Attached to a pending operation so its completion can be attributed
///
/// `kernel` is compared for identity only and never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VariantTag {
    pub group: VariantGroupId,
    pub index: usize,
    pub kernel: usize,
    /// Whether the completion should feed the selector
    pub sampled: bool,
}

/// What to dispatch for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantChoice {
    pub label: String,
    pub tag: VariantTag,
}

impl VariantChoice {
    pub fn index(&self) -> usize {
        self.tag.index
    }

    pub fn kernel(&self) -> usize {
        self.tag.kernel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectionPhase {
    WarmingUp { remaining: u32 },
    Exploring { next: usize },
    Exploiting,
}

#[derive(Debug, Clone)]
pub struct VariantGroup {
    name: String,
    variants: Vec<VariantSpec>,
    best_times: Vec<Option<u64>>,
    counter: u64,
    phase: SelectionPhase,
    best: Option<(usize, u64)>,
}

impl VariantGroup {
    fn new(name: String, variants: Vec<VariantSpec>, warmup: u32) -> Self {
        let phase = if warmup > 0 {
            SelectionPhase::WarmingUp { remaining: warmup }
        } else {
            SelectionPhase::Exploring { next: 0 }
        };
        VariantGroup {
            name,
            best_times: vec![None; variants.len()],
            variants,
            counter: 0,
            phase,
            best: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variants(&self) -> &[VariantSpec] {
        &self.variants
    }

    /// Dispatches attributed to this group so far
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn phase(&self) -> SelectionPhase {
        self.phase
    }

    /// `(index, device ns)` of the fastest observed variant
    pub fn best(&self) -> Option<(usize, u64)> {
        self.best
    }

    pub fn best_time(&self, index: usize) -> Option<u64> {
        self.best_times.get(index).copied().flatten()
    }

    fn first_valid_from(&self, start: usize) -> Option<usize> {
        for (index, variant) in self.variants.iter().enumerate().skip(start) {
            if variant.is_valid() {
                return Some(index);
            }
            tracing::info!(
                group = %self.name,
                variant = %variant.label,
                "skipping variant that failed to compile"
            );
        }
        None
    }

    fn choose(&mut self, id: VariantGroupId) -> Option<VariantChoice> {
        self.counter += 1;

        let (index, sampled) = loop {
            match self.phase {
                SelectionPhase::WarmingUp { remaining } => {
                    self.phase = if remaining > 1 {
                        SelectionPhase::WarmingUp {
                            remaining: remaining - 1,
                        }
                    } else {
                        SelectionPhase::Exploring { next: 0 }
                    };
                    break (self.first_valid_from(0)?, false);
                }
                SelectionPhase::Exploring { next } => match self.first_valid_from(next) {
                    Some(index) => {
                        self.phase = SelectionPhase::Exploring { next: index + 1 };
                        break (index, true);
                    }
                    None => {
                        tracing::debug!(group = %self.name, "exploration finished");
                        self.phase = SelectionPhase::Exploiting;
                    }
                },
                SelectionPhase::Exploiting => {
                    // Completions may still be in flight right after exploring
                    let index = match self.best {
                        Some((index, _)) => index,
                        None => self.variants.iter().position(VariantSpec::is_valid)?,
                    };
                    break (index, true);
                }
            }
        };

        let variant = &self.variants[index];
        let kernel = variant.kernel?;
        Some(VariantChoice {
            label: variant.label.clone(),
            tag: VariantTag {
                group: id,
                index,
                kernel,
                sampled,
            },
        })
    }

    fn observe(&mut self, tag: &VariantTag, device_ns: u64) -> bool {
        let identity = self.variants.get(tag.index).and_then(|v| v.kernel);
        if identity != Some(tag.kernel) {
            tracing::warn!(
                group = %self.name,
                index = tag.index,
                "completion does not match any variant of its group, ignoring"
            );
            return false;
        }
        if !tag.sampled {
            return false;
        }

        let slot = &mut self.best_times[tag.index];
        *slot = Some(slot.map_or(device_ns, |best| best.min(device_ns)));

        let improves = self.best.map_or(true, |(_, best)| device_ns < best);
        if improves {
            tracing::debug!(
                group = %self.name,
                variant = %self.variants[tag.index].label,
                device_ns,
                "new best variant"
            );
            self.best = Some((tag.index, device_ns));
        }
        improves
    }
}

/// All variant groups of the process
#[derive(Debug, Default)]
pub struct VariantSelector {
    groups: HashMap<VariantGroupId, VariantGroup>,
    next_id: VariantGroupId,
    warmup: u32,
}

impl VariantSelector {
    pub fn new(warmup: u32) -> Self {
        VariantSelector {
            groups: HashMap::new(),
            next_id: 1,
            warmup,
        }
    }

    pub fn register_group(
        &mut self,
        name: impl Into<String>,
        variants: Vec<VariantSpec>,
    ) -> VariantGroupId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        let group = VariantGroup::new(name.into(), variants, self.warmup);
        tracing::debug!(group = %group.name, id, variants = group.variants.len(), "variant group registered");
        self.groups.insert(id, group);
        id
    }

    /// Pick the variant for the next dispatch
    ///
    /// `Ok(None)` when the group has no valid variant at all.
    pub fn choose_variant(&mut self, id: VariantGroupId) -> ShimResult<Option<VariantChoice>> {
        let group = self
            .groups
            .get_mut(&id)
            .ok_or(ShimError::UnknownVariantGroup(id))?;
        Ok(group.choose(id))
    }

    /// Feed a completion back; returns whether the group's best changed
    pub fn on_completion(&mut self, tag: &VariantTag, device_ns: u64) -> ShimResult<bool> {
        let group = self
            .groups
            .get_mut(&tag.group)
            .ok_or(ShimError::UnknownVariantGroup(tag.group))?;
        Ok(group.observe(tag, device_ns))
    }

    pub fn group(&self, id: VariantGroupId) -> Option<&VariantGroup> {
        self.groups.get(&id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
