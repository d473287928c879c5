use crate::firestore::core::TargetId;

const RESERVED_BITS: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorId {
    TargetCache = 0,
    SyncEngine = 1,
}

/// Generates target ids that never collide between the target cache (even
/// ids) and the sync engine's limbo targets (odd ids).
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    generator_id: GeneratorId,
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator for query targets, starting after `last_id`.
    pub fn for_target_cache(last_id: TargetId) -> Self {
        Self::new(GeneratorId::TargetCache, last_id)
    }

    /// Generator for limbo resolution targets, which are never persisted.
    pub fn for_sync_engine() -> Self {
        Self::new(GeneratorId::SyncEngine, -1)
    }

    fn new(generator_id: GeneratorId, last_id: TargetId) -> Self {
        let mut generator = Self {
            generator_id,
            next_id: 0,
        };
        generator.seek(last_id);
        generator
    }

    fn seek(&mut self, target_id: TargetId) {
        let mask = (1 << RESERVED_BITS) - 1;
        let id = generator_id_value(self.generator_id);
        let new_id = (target_id & !mask) | id;
        self.next_id = if new_id > target_id {
            new_id
        } else {
            new_id + (1 << RESERVED_BITS)
        };
    }

    pub fn next(&mut self) -> TargetId {
        let next = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        next
    }
}

fn generator_id_value(id: GeneratorId) -> TargetId {
    id as TargetId
}
