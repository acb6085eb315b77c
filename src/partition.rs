//! Splitting a pass's work set into per-slot chunks

use crate::types::ItemId;

/// Split `ids` into `min(slots, ids.len())` contiguous chunks
///
/// The first `len % slots` chunks get one extra item, so sizes never differ
/// by more than one. Input order is preserved, both across and within chunks.
/// `slots == 0` is treated as a single slot.
pub fn partition(ids: &[ItemId], slots: usize) -> Vec<Vec<ItemId>> {
    let slots = slots.max(1).min(ids.len());
    if slots == 0 {
        return Vec::new();
    }

    let base = ids.len() / slots;
    let extra = ids.len() % slots;

    let mut chunks = Vec::with_capacity(slots);
    let mut rest = ids;
    for i in 0..slots {
        let size = base + usize::from(i < extra);
        let (chunk, tail) = rest.split_at(size);
        chunks.push(chunk.to_vec());
        rest = tail;
    }
    chunks
}
