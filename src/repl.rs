//! Thread-scoped default connection.
//!
//! A convenience for interactive use: each OS thread can hold one default
//! connection, so expression evaluation can omit an explicit connection
//! argument. Explicit context-scoped storage, not process-global state.

use std::cell::RefCell;
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::errors::{Error, Result};
use crate::net::Connection;
use crate::protocol_core::{OptArgs, RunResult};
use crate::term::Term;

thread_local! {
    static REPL_CONNECTION: RefCell<Option<Arc<Connection>>> = const { RefCell::new(None) };
}

/// Install `connection` as this thread's default.
pub fn set_connection(connection: Arc<Connection>) {
    REPL_CONNECTION.with(|slot| *slot.borrow_mut() = Some(connection));
}

/// This thread's default connection, if one was installed.
pub fn connection() -> Option<Arc<Connection>> {
    REPL_CONNECTION.with(|slot| slot.borrow().clone())
}

/// Drop this thread's default connection.
pub fn clear_connection() {
    REPL_CONNECTION.with(|slot| *slot.borrow_mut() = None);
}

/// Run a term on this thread's default connection.
pub fn run(term: &Term, options: OptArgs) -> Result<RunResult<Cursor>> {
    let connection = connection()
        .ok_or_else(|| Error::driver("run must be given a connection to run on."))?;
    connection.run(term, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn missing_default_connection_is_a_driver_error() {
        clear_connection();
        let err = run(&Term::datum(1), OptArgs::new()).unwrap_err();
        assert!(matches!(err, Error::Driver(_)));
    }

    #[test]
    fn slots_are_per_thread() {
        // Installing nothing on a fresh thread leaves its slot empty even
        // while other threads hold defaults.
        clear_connection();
        let other = thread::spawn(|| connection().is_none()).join().unwrap();
        assert!(other);
    }
}
