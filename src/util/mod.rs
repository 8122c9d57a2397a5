pub mod num;

/// Run `f` on a path the optimiser should treat as unlikely.
#[cold]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
