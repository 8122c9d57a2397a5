//! Byte-granular taint tracking and heap bookkeeping for a monitored program.
//!
//! The instrumentation layer (which we do not implement) calls into an
//! [`Engine`] on every allocation, free, custom-pool event and I/O syscall
//! return. The engine keeps a shadow byte for every address of the target
//! ([`shadow::ShadowState`]), a registry of live heap chunks, a quarantine of
//! recently freed ones, and a table of tainted file descriptors. On demand it
//! classifies every live chunk by how it is reached ([`graph::leak`]).
//!
//! ```
//! use taintheap::{alloc::{heap::ArenaHeap, AllocKind, CallSite}, Config, Engine};
//!
//! let mut engine = Engine::new(Config::default(), ArenaHeap::default());
//! let a = engine.on_alloc(AllocKind::Malloc, 64, 8, false, CallSite::UNKNOWN).unwrap();
//! assert_eq!(engine.check_no_access(a, 64), None);
//! assert_eq!(engine.is_range_no_access(a - 16, 16), None);
//! engine.on_free(a, AllocKind::Malloc).unwrap();
//! assert!(engine.on_free(a, AllocKind::Malloc).is_err());
//! ```

pub mod alloc;
pub mod config;
pub mod engine;
pub mod error;
pub mod externc;
pub mod graph;
pub mod serialize;
pub mod shadow;
pub mod sync;
pub mod taint;
pub mod util;

pub use config::Config;
pub use engine::Engine;
pub use error::EngineError;

/// An address in the monitored program's address space.
pub type Addr = usize;

/// Install `env_logger` as the `log` backend. Safe to call more than once;
/// only the first call has any effect.
pub fn init_logging() {
    _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(cfg!(test))
        .try_init();
}
