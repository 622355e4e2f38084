/// Runs a closure when dropped, unless disarmed first.
///
/// Used on worker threads to release their gate whether the loop exits
/// normally or by unwinding.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken on drop or disarm so the closure runs at most once.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    /// Prevents the closure from running on drop.
    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guard_runs_on_drop() {
        let hits = Cell::new(0);
        {
            let _guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            assert_eq!(hits.get(), 0);
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_disarmed_guard_is_noop() {
        let hits = Cell::new(0);
        {
            let mut guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            guard.disarm();
        }
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_guard_runs_on_unwind() {
        let hits = Cell::new(0);
        let res = crate::utils::guarded(|| {
            let _guard = ScopeGuard::new(|| hits.set(hits.get() + 1));
            panic!("unwinding");
        });
        assert!(res.is_err());
        assert_eq!(hits.get(), 1);
    }
}
