//! Reference frame slot table.
//!
//! Maps decoded pictures to slots of the session's reference image. The
//! table has `max_references + 1` slots; the null slot one past the end is
//! implicit and addressed whenever a reference cannot be resolved.
//!
//! A slot is free while `last_used == 0`; sequence numbers start at 1.
//! Eviction prefers, in order: the slot already holding the target, a
//! never-used slot, then the least recently used slot not touched by the
//! current frame.

use serde::Serialize;
use tracing::{debug, warn};

use crate::buffer::{BufferId, VideoBuffer};
use crate::error::DecodeError;

/// One slot of the table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RefSlot {
    /// Picture currently decoded into this slot. Not an owning reference.
    pub owner: Option<BufferId>,
    /// Sequence of the last frame that named this slot; 0 while free.
    pub last_used: u64,
    /// Top field of the picture has been decoded.
    pub decoded_top: bool,
    /// Bottom field of the picture has been decoded.
    pub decoded_bottom: bool,
    /// One field of a pair is decoded and its partner is pending.
    pub decoded_first: bool,
}

/// How a named reference resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum RefResolution {
    /// The picture owns this slot.
    Slot(u32),
    /// The picture's recorded slot does not hold it; the null slot is used.
    Anomaly,
}

impl RefResolution {
    pub fn slot(self) -> Option<u32> {
        match self {
            Self::Slot(slot) => Some(slot),
            Self::Anomaly => None,
        }
    }
}

/// Result of resolving one frame's references and target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefAssignment {
    /// One entry per non-empty named reference, in order.
    pub references: Vec<RefResolution>,
    pub target_slot: u32,
    /// Previous owner of the target slot, if one was evicted.
    pub evicted: Option<BufferId>,
}

impl RefAssignment {
    pub fn anomalies(&self) -> u32 {
        self.references
            .iter()
            .filter(|r| **r == RefResolution::Anomaly)
            .count() as u32
    }
}

/// Which part of the target picture a frame decodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldCoding {
    Frame,
    Top,
    Bottom,
}

#[derive(Debug)]
pub struct RefTable {
    slots: Vec<RefSlot>,
    max_references: u32,
    evictions: u64,
}

impl RefTable {
    pub fn new(max_references: u32) -> Self {
        Self {
            slots: vec![RefSlot::default(); max_references as usize + 1],
            max_references,
            evictions: 0,
        }
    }

    pub fn max_references(&self) -> u32 {
        self.max_references
    }

    /// Number of real slots (excluding the null slot).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the implicit null slot.
    pub fn null_slot(&self) -> u32 {
        self.max_references + 1
    }

    pub fn slot(&self, index: u32) -> Option<&RefSlot> {
        self.slots.get(index as usize)
    }

    pub fn slots(&self) -> &[RefSlot] {
        &self.slots
    }

    /// Slots that currently hold a picture.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_some()).count()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Slot holding `buffer`, if its recorded slot still does.
    pub fn lookup(&self, buffer: &VideoBuffer) -> Option<u32> {
        let index = buffer.valid_ref()?;
        let slot = self.slots.get(index as usize)?;
        (slot.owner == Some(buffer.id())).then_some(index)
    }

    /// Refresh every named reference and place the target picture.
    ///
    /// References whose recorded slot no longer holds them are reported as
    /// [`RefResolution::Anomaly`] and left untouched. Fails with
    /// [`DecodeError::TooManyReferences`] if more than `max_references`
    /// pictures are named.
    pub fn handle_references(
        &mut self,
        refs: &[&VideoBuffer],
        target: &VideoBuffer,
        sequence: u64,
    ) -> Result<RefAssignment, DecodeError> {
        if refs.len() > self.max_references as usize {
            return Err(DecodeError::TooManyReferences {
                requested: refs.len() as u32,
                max: self.max_references,
            });
        }

        let mut references = Vec::with_capacity(refs.len());
        for buffer in refs {
            match self.lookup(buffer) {
                Some(index) => {
                    self.slots[index as usize].last_used = sequence;
                    references.push(RefResolution::Slot(index));
                }
                None => {
                    warn!(
                        buffer = %buffer.id(),
                        recorded = ?buffer.valid_ref(),
                        sequence,
                        "Reference picture does not own its slot"
                    );
                    references.push(RefResolution::Anomaly);
                }
            }
        }

        if let Some(index) = self.lookup(target) {
            self.slots[index as usize].last_used = sequence;
            return Ok(RefAssignment {
                references,
                target_slot: index,
                evicted: None,
            });
        }

        let mut chosen: Option<usize> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.owner == Some(target.id()) {
                chosen = Some(i);
                break;
            }
            if slot.last_used < sequence {
                if slot.last_used == 0 {
                    chosen = Some(i);
                    break;
                }
                if chosen.map_or(true, |c| slot.last_used < self.slots[c].last_used) {
                    chosen = Some(i);
                }
            }
        }
        let index = chosen.ok_or(DecodeError::NoReferenceSlot { sequence })?;

        let slot = &mut self.slots[index];
        let evicted = slot.owner.filter(|owner| *owner != target.id());
        if let Some(previous) = evicted {
            self.evictions += 1;
            debug!(slot = index, %previous, target = %target.id(), sequence, "Evicted reference slot");
        }
        slot.owner = Some(target.id());
        slot.last_used = sequence;
        slot.decoded_top = false;
        slot.decoded_bottom = false;
        slot.decoded_first = false;
        target.set_valid_ref(index as u32);

        Ok(RefAssignment {
            references,
            target_slot: index as u32,
            evicted,
        })
    }

    /// Record which field of the picture in `slot` a frame decodes and
    /// return whether it is the second field of a pair.
    pub fn mark_decoded(&mut self, slot: u32, coding: FieldCoding) -> bool {
        let Some(slot) = self.slots.get_mut(slot as usize) else {
            return false;
        };
        match coding {
            FieldCoding::Frame => {
                slot.decoded_top = true;
                slot.decoded_bottom = true;
                slot.decoded_first = false;
                false
            }
            FieldCoding::Top | FieldCoding::Bottom => {
                let bottom = coding == FieldCoding::Bottom;
                let second_field = slot.decoded_first
                    && if bottom {
                        slot.decoded_top && !slot.decoded_bottom
                    } else {
                        slot.decoded_bottom && !slot.decoded_top
                    };
                if bottom {
                    slot.decoded_bottom = true;
                } else {
                    slot.decoded_top = true;
                }
                slot.decoded_first = !second_field;
                second_field
            }
        }
    }
}
