use std::sync::{Mutex, PoisonError};

use crate::{alloc::heap::ClientHeap, Config, Engine};

/// An [`Engine`] that many instrumented threads can call into.
///
/// Every hook runs under one lock, so hooks are serialized with respect to
/// each other just as the instrumentation framework serializes them. A hook
/// that panics poisons the lock but leaves the engine usable: the state it
/// protects is only ever updated through methods that keep it consistent
/// between statements, so we take the guard back instead of propagating the
/// poison into every other thread.
pub struct SharedEngine<H> {
    engine: Mutex<Engine<H>>,
}

impl<H> SharedEngine<H>
where
    H: ClientHeap,
{
    pub fn new(config: Config, heap: H) -> Self {
        Self::from_engine(Engine::new(config, heap))
    }

    pub fn from_engine(engine: Engine<H>) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Run `f` with exclusive access to the engine.
    pub fn with<R>(&self, f: impl FnOnce(&mut Engine<H>) -> R) -> R {
        let mut guard = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn into_inner(self) -> Engine<H> {
        self.engine
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{heap::ArenaHeap, AllocKind, CallSite};

    #[test]
    fn hooks_from_many_threads_are_serialized() {
        let shared = SharedEngine::new(Config::default(), ArenaHeap::default());
        crossbeam::scope(|s| {
            for t in 0..4u64 {
                let shared = &shared;
                s.spawn(move |_| {
                    for i in 0..50 {
                        let addr = shared
                            .with(|e| e.on_alloc(AllocKind::Malloc, 24, 8, false, CallSite(t * 100 + i)))
                            .unwrap();
                        shared.with(|e| e.on_free(addr, AllocKind::Malloc)).unwrap();
                    }
                });
            }
        })
        .unwrap();

        let engine = shared.into_inner();
        let stats = engine.malloc_stats();
        assert_eq!(stats.n_mallocs, 200);
        assert_eq!(stats.n_frees, 200);
        assert_eq!(stats.blocks_in_use, 0);
        assert!(engine.errors().is_empty());
    }

    #[test]
    fn a_panicking_hook_does_not_wedge_the_engine() {
        let shared = SharedEngine::new(Config::default(), ArenaHeap::default());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            shared.with(|_| panic!("hook blew up"))
        }));
        assert!(result.is_err());
        let addr = shared.with(|e| e.malloc(8, CallSite::UNKNOWN)).unwrap();
        assert!(shared.with(|e| e.chunks().get(addr).is_some()));
    }
}
