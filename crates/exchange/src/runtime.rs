//! I/O thread bookkeeping.
//!
//! Threads of the I/O runtime mark themselves on start so that blocking primitives can refuse
//! to run there instead of stalling the event loop.

use std::cell::Cell;

thread_local! {
    static IO_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_io_thread() {
    IO_THREAD.with(|flag| flag.set(true));
}

/// Whether the current thread belongs to the server's I/O pool.
pub fn is_io_thread() -> bool {
    IO_THREAD.with(Cell::get)
}
