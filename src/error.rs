use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    alloc::{AllocKind, Chunk},
    serialize::serde_hex,
    Addr,
};

/// Something the monitored program did wrong (or that we could not do for
/// it). None of these stop the program: the hook that noticed reports it and
/// carries on with whatever best-effort behaviour applies.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineError {
    /// Free of an address that was never allocated.
    InvalidFree {
        #[serde(with = "serde_hex")]
        addr: Addr,
    },
    /// Free of a block that is already sitting in quarantine.
    DoubleFree {
        #[serde(with = "serde_hex")]
        addr: Addr,
    },
    /// e.g. `operator new[]` memory passed to `free()`.
    FreeMismatch {
        #[serde(with = "serde_hex")]
        addr: Addr,
        allocated: AllocKind,
        freed: AllocKind,
    },
    /// A pool hook named a pool that does not exist.
    IllegalPool {
        #[serde(with = "serde_hex")]
        pool: Addr,
    },
    /// A pool was created (or moved) onto an id that is already live.
    DuplicatePool {
        #[serde(with = "serde_hex")]
        pool: Addr,
    },
    /// A size that is negative when read as signed.
    SillyArgs { func: String, size: usize },
    /// `nmemb * size` does not fit in an address.
    SizeOverflow {
        func: String,
        nmemb: usize,
        size: usize,
    },
    /// The underlying heap could not satisfy a request.
    OutOfMemory { size: usize },
    /// The chunks of a custom pool overlap.
    PoolInsane {
        #[serde(with = "serde_hex")]
        pool: Addr,
        chunks: Vec<Chunk>,
    },
}

/// The broad classes of [`EngineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Reported, the offending operation is skipped.
    IllegalUse,
    /// Reported, the operation still completes.
    Mismatch,
    /// Reported with a full dump. A bug in the program's own allocator.
    Invariant,
    /// Not reported; the caller gets an absent result.
    Exhaustion,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::InvalidFree { .. }
            | EngineError::DoubleFree { .. }
            | EngineError::IllegalPool { .. }
            | EngineError::DuplicatePool { .. }
            | EngineError::SillyArgs { .. }
            | EngineError::SizeOverflow { .. } => ErrorCategory::IllegalUse,
            EngineError::FreeMismatch { .. } => ErrorCategory::Mismatch,
            EngineError::PoolInsane { .. } => ErrorCategory::Invariant,
            EngineError::OutOfMemory { .. } => ErrorCategory::Exhaustion,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidFree { addr } => {
                write!(f, "invalid free() / delete / delete[] of {addr:#x}")
            }
            EngineError::DoubleFree { addr } => {
                write!(f, "double free of {addr:#x} (block is in the freed-blocks queue)")
            }
            EngineError::FreeMismatch {
                addr,
                allocated,
                freed,
            } => write!(
                f,
                "mismatched free of {addr:#x}: allocated with {allocated}, freed as {freed}"
            ),
            EngineError::IllegalPool { pool } => write!(f, "illegal memory pool address {pool:#x}"),
            EngineError::DuplicatePool { pool } => {
                write!(f, "memory pool {pool:#x} already exists")
            }
            EngineError::SillyArgs { func, size } => {
                write!(f, "silly argument to {func}(): size {} looks negative", *size as isize)
            }
            EngineError::SizeOverflow { func, nmemb, size } => {
                write!(f, "silly arguments to {func}(): {nmemb} * {size} overflows")
            }
            EngineError::OutOfMemory { size } => write!(f, "out of memory allocating {size} bytes"),
            EngineError::PoolInsane { pool, chunks } => write!(
                f,
                "memory pool {pool:#x} is inconsistent ({} chunks, some overlapping)",
                chunks.len()
            ),
        }
    }
}

impl std::error::Error for EngineError {}

/// Errors kept by a fresh [`ErrorLog`].
pub const ERROR_LOG_CAPACITY: usize = 1024;

/// The most recent errors the engine has reported, in order, plus a count of
/// all of them.
///
/// Every error is logged when it is recorded, but only the last `capacity`
/// are kept: a program that keeps misbehaving must not make us grow without
/// bound. Once full, the older half is dropped in one go.
#[derive(Debug)]
pub struct ErrorLog {
    errors: Vec<EngineError>,
    capacity: usize,
    total: u64,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_capacity(ERROR_LOG_CAPACITY)
    }
}

impl ErrorLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            errors: Vec::new(),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    /// Log `err` once and keep it. Returns it back so callers can write
    /// `return Err(self.errors.record(..))`.
    pub fn record(&mut self, err: EngineError) -> EngineError {
        match err.category() {
            ErrorCategory::IllegalUse | ErrorCategory::Mismatch => log::warn!("{err}"),
            ErrorCategory::Invariant => {
                log::error!("{err}");
                if let EngineError::PoolInsane { chunks, .. } = &err {
                    for (i, chunk) in chunks.iter().enumerate() {
                        log::error!(
                            "  chunk {i:>4}: {:#x}..{:#x} ({} bytes, {})",
                            chunk.base,
                            chunk.end(),
                            chunk.size,
                            chunk.kind
                        );
                    }
                }
            }
            ErrorCategory::Exhaustion => log::debug!("{err}"),
        }
        if self.errors.len() >= self.capacity {
            let keep = self.capacity / 2;
            self.errors.drain(..self.errors.len() - keep);
        }
        self.errors.push(err.clone());
        self.total += 1;
        err
    }

    /// Errors recorded over the engine's lifetime, including those no
    /// longer kept.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn errors(&self) -> &[EngineError] {
        &self.errors
    }

    pub fn take(&mut self) -> Vec<EngineError> {
        std::mem::take(&mut self.errors)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}
