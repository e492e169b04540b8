//! Parser-visible mutable state slots
//!
//! The machine carries a small fixed pool of register slots. A [`Reg`] is
//! a shared handle that gets bound to a slot the first time a grammar
//! using it is compiled; the binding then sticks for the lifetime of the
//! handle, so one register can be shared between several parsers.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::CompileError;

/// Number of register slots in the machine.
pub const REGISTER_COUNT: usize = 4;

/// The shared allocation cell behind a register handle.
pub(crate) struct RegSlot {
    slot: Mutex<Option<usize>>,
}

impl RegSlot {
    pub(crate) fn slot(&self) -> Option<usize> {
        *self.slot.lock()
    }
}

/// A typed handle to one machine register.
///
/// Create with [`Reg::new`], then read and write it inside a grammar with
/// [`Reg::get`] and [`Reg::put`] (defined alongside the other
/// combinators). Registers behave as state global to one parse; registers
/// used only inside a recursive parser are saved and restored around each
/// recursive call, so every invocation sees its own copy.
pub struct Reg<A> {
    pub(crate) cell: Arc<RegSlot>,
    _marker: PhantomData<fn(A) -> A>,
}

impl<A> Reg<A> {
    /// Create a fresh, unallocated register.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Reg<A> {
        Reg {
            cell: Arc::new(RegSlot { slot: Mutex::new(None) }),
            _marker: PhantomData,
        }
    }
}

impl<A> Clone for Reg<A> {
    fn clone(&self) -> Self {
        Reg { cell: Arc::clone(&self.cell), _marker: PhantomData }
    }
}

/// Bind every unallocated register in `used` to a free slot.
///
/// Already-bound registers keep their slot. Fails when the demand exceeds
/// the pool.
pub(crate) fn allocate(used: &[Arc<RegSlot>]) -> Result<(), CompileError> {
    let mut taken = [false; REGISTER_COUNT];
    for cell in used {
        if let Some(slot) = cell.slot() {
            taken[slot] = true;
        }
    }
    for cell in used {
        let mut slot = cell.slot.lock();
        if slot.is_none() {
            match taken.iter().position(|t| !t) {
                Some(free) => {
                    taken[free] = true;
                    *slot = Some(free);
                }
                None => return Err(CompileError::TooManyRegisters),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_assigns_distinct_slots() {
        let regs: Vec<Arc<RegSlot>> = (0..4)
            .map(|_| Arc::new(RegSlot { slot: Mutex::new(None) }))
            .collect();
        allocate(&regs).unwrap();
        let mut slots: Vec<usize> = regs.iter().map(|r| r.slot().unwrap()).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_allocation_is_stable() {
        let reg = Arc::new(RegSlot { slot: Mutex::new(None) });
        allocate(std::slice::from_ref(&reg)).unwrap();
        let first = reg.slot();
        allocate(std::slice::from_ref(&reg)).unwrap();
        assert_eq!(reg.slot(), first);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let regs: Vec<Arc<RegSlot>> = (0..5)
            .map(|_| Arc::new(RegSlot { slot: Mutex::new(None) }))
            .collect();
        assert_eq!(allocate(&regs), Err(CompileError::TooManyRegisters));
    }
}
