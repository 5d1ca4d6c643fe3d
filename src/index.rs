/// Row Index - Optimistic Key to Row Offset Cache
///
/// The index maps each tracked key to the offset of its row in the display
/// body. It is never authoritative: users can sort, insert or delete rows
/// behind our back, so callers verify the rows an index lookup points at and
/// rebuild from the display's key column when they disagree.
///
/// Local structural changes are applied incrementally, the same way a view
/// mapping follows its parent table:
///
/// - When a row is inserted at offset I, all offsets >= I are incremented.
/// - When a row is deleted at offset I, its key is dropped and all offsets
///   > I are decremented.

use crate::value::CellValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct RowIndex {
    offsets: HashMap<CellValue, usize>,
}

impl RowIndex {
    pub fn new() -> Self {
        RowIndex {
            offsets: HashMap::new(),
        }
    }

    /// Build an index from a display's key column, top to bottom.
    ///
    /// Blank cells are not keys. Should a key appear twice the lower row wins.
    pub fn from_key_column(values: Vec<CellValue>) -> Self {
        let offsets = values
            .into_iter()
            .enumerate()
            .filter(|(_, key)| !key.is_empty())
            .map(|(offset, key)| (key, offset))
            .collect();
        RowIndex { offsets }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn contains(&self, key: &CellValue) -> bool {
        self.offsets.contains_key(key)
    }

    pub fn get(&self, key: &CellValue) -> Option<usize> {
        self.offsets.get(key).copied()
    }

    pub fn insert(&mut self, key: CellValue, offset: usize) {
        self.offsets.insert(key, offset);
    }

    /// Account for a row deleted at `offset`; any key pointing at it is dropped.
    pub fn adjust_for_delete(&mut self, offset: usize) {
        self.offsets.retain(|_, row| *row != offset);
        for row in self.offsets.values_mut() {
            if *row > offset {
                *row -= 1;
            }
        }
    }

    /// Forget `keys` and close the gaps left by deleting their rows.
    ///
    /// `deleted` holds pre-deletion offsets, as passed to a batched delete.
    pub fn remove_deleted(&mut self, deleted: &[(CellValue, usize)]) {
        for (key, _) in deleted {
            self.offsets.remove(key);
        }
        let mut offsets: Vec<usize> = deleted.iter().map(|(_, offset)| *offset).collect();
        offsets.sort_unstable_by(|a, b| b.cmp(a));
        offsets.dedup();
        for offset in offsets {
            self.adjust_for_delete(offset);
        }
    }
}
