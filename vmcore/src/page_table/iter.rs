//! A non-recursive leaf-PTE walker.
//!
//! Grounded on the teacher's `memory::page_table::iter`: rather than
//! recursing through at most three levels, the walk keeps an
//! [`ArrayVec`]-backed stack of `(level, base_va, index, table)` frames,
//! sized to the fixed tree depth. Used here by [`super::PageTable::dump`];
//! the mutating tree operations (`add_mapping`, `shared_*`, `Drop`) use
//! plain recursion instead, since the `is_root` flag they thread through
//! (to implement the "don't follow SHARED below the root" rule) reads
//! more clearly as an explicit function argument than as stack state.

use arrayvec::ArrayVec;

use crate::addr::VirtAddr;

use super::entry::{Level, PtEntry};
use super::PageTableEntries;

struct Frame<'a> {
    level: Level,
    base_va: VirtAddr,
    next_index: usize,
    table: &'a PageTableEntries,
}

/// Yields every leaf PTE reachable from a root table, in address order,
/// together with the virtual address its mapping begins at.
pub struct Leaves<'a> {
    stack: ArrayVec<Frame<'a>, 3>,
    resolve_child: fn(PtEntry) -> Option<&'a PageTableEntries>,
}

impl<'a> Leaves<'a> {
    pub(super) fn new(root: &'a PageTableEntries, resolve_child: fn(PtEntry) -> Option<&'a PageTableEntries>) -> Self {
        let mut stack = ArrayVec::new();
        stack.push(Frame {
            level: Level::L2,
            base_va: VirtAddr::new(0),
            next_index: 0,
            table: root,
        });
        Self { stack, resolve_child }
    }
}

impl<'a> Iterator for Leaves<'a> {
    type Item = (VirtAddr, Level, &'a PtEntry);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = self.stack.last_mut()?;
            if frame.next_index >= 512 {
                self.stack.pop();
                continue;
            }
            let index = frame.next_index;
            frame.next_index += 1;
            let pte = &frame.table.0[index];
            let va = frame.base_va.byte_add(index << frame.level.shift());
            let level = frame.level;

            if pte.is_leaf() {
                return Some((va, level, pte));
            }
            if pte.is_non_leaf()
                && let Some(child_level) = level.child()
                && let Some(child_table) = (self.resolve_child)(*pte)
            {
                self.stack.push(Frame {
                    level: child_level,
                    base_va: va,
                    next_index: 0,
                    table: child_table,
                });
            }
        }
    }
}
