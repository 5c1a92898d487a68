//! Chunk coalescing and cross-snapshot comparison.

use crate::models::Chunk;

/// Merges logically contiguous chunks into one chunk.
///
/// The physical start of a merged chunk is that of its first member; the
/// other members' physical addresses are dropped, which is why comparison
/// always runs on unsquashed chunks.
pub fn squash_chunks(chunks: &[Chunk]) -> Vec<Chunk> {
    let Some(first) = chunks.first() else {
        return Vec::new();
    };

    let mut squashed = Vec::new();
    let mut current = *first;

    for chunk in &chunks[1..] {
        if current.start + current.length == chunk.start {
            current.length += chunk.length;
            continue;
        }
        squashed.push(current);
        current = *chunk;
    }
    squashed.push(current);

    squashed
}

/// Returns the chunks of `newer` that have no exact counterpart in
/// `older`. A counterpart must match on physical start, logical start and
/// length; anything else means the extent was rewritten since the older
/// snapshot was taken and must be re-read.
pub fn compare_chunks(newer: &[Chunk], older: &[Chunk]) -> Vec<Chunk> {
    let mut ret = Vec::new();
    for chunk in newer {
        let found = older.iter().any(|prev| {
            prev.physical == chunk.physical
                && prev.start == chunk.start
                && prev.length == chunk.length
        });
        if !found {
            ret.push(*chunk);
        }
    }
    ret
}
