use std::fmt;

use crate::field::FieldSlot;

/// Generational index into the arena.
/// Allows safe reuse of slots with use-after-free detection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FieldId {
    pub index: u32,
    pub generation: u32,
}

impl FieldId {
    pub const INVALID: Self = Self { index: u32::MAX, generation: 0 };

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    field: Option<FieldSlot>,
}

/// Arena allocator for field records.
pub struct Arena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

impl Arena {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
        }
    }

    /// Allocate a slot for a field record.
    pub fn alloc(&mut self, field: FieldSlot) -> FieldId {
        if let Some(index) = self.free_list.pop() {
            // Reuse freed slot, generation was already bumped on free
            let slot = &mut self.slots[index as usize];
            slot.field = Some(field);
            FieldId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                field: Some(field),
            });
            FieldId { index, generation: 0 }
        }
    }

    /// Free a slot, returning the record it held.
    /// The generation is bumped immediately so stale handles are detectable.
    pub fn free(&mut self, id: FieldId) -> Option<FieldSlot> {
        if self.is_valid(id) {
            let slot = &mut self.slots[id.index as usize];
            slot.generation += 1;
            self.free_list.push(id.index);
            slot.field.take()
        } else {
            None
        }
    }

    /// Check if a FieldId refers to a live slot (correct generation).
    pub fn is_valid(&self, id: FieldId) -> bool {
        id.index < self.slots.len() as u32
            && self.slots[id.index as usize].generation == id.generation
            && self.slots[id.index as usize].field.is_some()
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.field.as_ref())
    }

    pub fn get_mut(&mut self, id: FieldId) -> Option<&mut FieldSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.field.as_mut())
    }

    /// Number of slots ever allocated (including freed ones).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of live fields.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Iterate over live fields.
    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &FieldSlot)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.field.as_ref().map(|f| {
                (
                    FieldId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    f,
                )
            })
        })
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
