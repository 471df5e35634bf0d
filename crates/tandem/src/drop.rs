//! Utilities related to destructors and drop.

/// Drop guard returned by [`defer`].
#[must_use = "`Defer` should be assigned to a variable, or it will be dropped immediately"]
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Defer<F> {
    /// Runs the deferred callback now instead of on drop.
    pub fn run(mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

/// Returns a value that runs `cb` when dropped (also while unwinding).
pub fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        panic::{catch_unwind, AssertUnwindSafe},
    };

    use super::*;

    #[test]
    fn runs_once() {
        let hits = Cell::new(0);
        let guard = defer(|| hits.set(hits.get() + 1));
        guard.run();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn runs_on_unwind() {
        let hits = Cell::new(0);
        catch_unwind(AssertUnwindSafe(|| {
            let _guard = defer(|| hits.set(hits.get() + 1));
            panic!("unwinding");
        }))
        .unwrap_err();
        assert_eq!(hits.get(), 1);
    }
}
