//! Inverted index over integer attributes.
//!
//! Maps `field -> value -> bitmap of record ids`. Bitmaps are roaring
//! bitmaps, so membership and set algebra stay sub-linear in cardinality
//! even with tens of millions of ids. Ids are stored as 32 bits; the
//! coordinator's allocator would have to hand out four billion ids before
//! that width matters.

use std::collections::HashMap;

use roaring::RoaringBitmap;

use crate::model::{FilterInput, FilterOp};

/// In-memory filter index. Rebuilt from the WAL on recovery; never
/// persisted on its own.
#[derive(Debug, Default)]
pub struct IntFilterIndex {
    fields: HashMap<String, HashMap<i64, RoaringBitmap>>,
}

impl IntFilterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to the posting set for `(field, value)`, creating the nested
    /// maps and bitmap on demand.
    pub fn upsert(&mut self, field: &str, value: i64, id: u64) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .entry(value)
            .or_default()
            .insert(id as u32);
    }

    /// Remove `id` from the posting set for `(field, value)`, dropping the
    /// bitmap entry once empty. Unknown fields and values are no-ops.
    pub fn remove(&mut self, field: &str, value: i64, id: u64) {
        let Some(by_value) = self.fields.get_mut(field) else {
            return;
        };
        let Some(bitmap) = by_value.get_mut(&value) else {
            return;
        };
        bitmap.remove(id as u32);
        if bitmap.is_empty() {
            by_value.remove(&value);
        }
    }

    /// Apply one filter against a seed bitmap, returning a new bitmap.
    ///
    /// The seed is an accumulator: each call unions its matches into the
    /// seed, so folding several inputs through `apply` ORs the filters
    /// together rather than intersecting them. Conjunctive composition is
    /// available via [`apply_intersect`](Self::apply_intersect) but the
    /// query path does not use it.
    ///
    /// `Equal` with an unknown field or value returns a clone of the seed;
    /// `NotEqual` unions every posting set of the field except the target's.
    pub fn apply(&self, input: &FilterInput, seed: &RoaringBitmap) -> RoaringBitmap {
        let Some(by_value) = self.fields.get(&input.field) else {
            return seed.clone();
        };

        match input.op {
            FilterOp::Equal => match by_value.get(&input.target) {
                Some(bitmap) => seed | bitmap,
                None => seed.clone(),
            },
            FilterOp::NotEqual => {
                let mut result = seed.clone();
                for (value, bitmap) in by_value {
                    if *value == input.target {
                        continue;
                    }
                    result |= bitmap;
                }
                result
            }
        }
    }

    /// Conjunctive variant of [`apply`](Self::apply): intersect the filter's
    /// matches with the seed, or take them outright when the seed is `None`.
    pub fn apply_intersect(
        &self,
        input: &FilterInput,
        seed: Option<&RoaringBitmap>,
    ) -> RoaringBitmap {
        let matches = self.apply(input, &RoaringBitmap::new());
        match seed {
            Some(seed) => seed & &matches,
            None => matches,
        }
    }
}
