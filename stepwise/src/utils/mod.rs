pub(crate) mod panic;
pub(crate) use panic::guarded;

pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;
