use cortex_m::interrupt::{self, CriticalSection};

/// Masks interrupts around a register sequence that an interrupt handler must not
/// observe half done.
pub trait InterruptMask {
    /// Runs `f` with interrupts masked and returns its result.
    fn free<T>(&self, f: impl FnOnce(&CriticalSection) -> T) -> T;
}

/// Masks interrupts on the Cortex-M core with `cpsid` / `cpsie`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CortexMMask;

impl InterruptMask for CortexMMask {
    fn free<T>(&self, f: impl FnOnce(&CriticalSection) -> T) -> T {
        interrupt::free(f)
    }
}

impl<M: InterruptMask> InterruptMask for &M {
    fn free<T>(&self, f: impl FnOnce(&CriticalSection) -> T) -> T {
        (**self).free(f)
    }
}
