//! Which file descriptors are taint sources, per thread.

use hashbrown::HashMap;

/// The monitored program's thread id, as the instrumentation layer numbers
/// them.
pub type ThreadId = u32;

/// Descriptors at or above this are never tracked.
pub const MAX_FDS: usize = 1 << 20;

/// Growable `fd -> tainted?` array for one thread.
#[derive(Clone, Debug, Default)]
pub struct FdTaintTable {
    tainted: Vec<bool>,
}

impl FdTaintTable {
    pub fn new(taint_stdin: bool) -> Self {
        let mut table = Self::default();
        if taint_stdin {
            table.set(0, true);
        }
        table
    }

    fn index(fd: i32) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&fd| fd < MAX_FDS)
    }

    pub fn is_tainted(&self, fd: i32) -> bool {
        Self::index(fd)
            .and_then(|fd| self.tainted.get(fd).copied())
            .unwrap_or(false)
    }

    /// Negative and out-of-range descriptors are ignored.
    pub fn set(&mut self, fd: i32, tainted: bool) {
        let Some(fd) = Self::index(fd) else {
            log::debug!("ignoring out-of-range fd {fd}");
            return;
        };
        if fd >= self.tainted.len() {
            if !tainted {
                return;
            }
            self.tainted.resize(fd + 1, false);
        }
        self.tainted[fd] = tainted;
    }

    /// Every tainted descriptor, ascending.
    pub fn tainted(&self) -> impl Iterator<Item = i32> + '_ {
        self.tainted
            .iter()
            .enumerate()
            .filter(|&(_, &tainted)| tainted)
            .map(|(fd, _)| fd as i32)
    }
}

/// One [`FdTaintTable`] per thread, created on the thread's first syscall.
#[derive(Debug, Default)]
pub struct ThreadFdTables {
    threads: HashMap<ThreadId, FdTaintTable, ahash::RandomState>,
    taint_stdin: bool,
}

impl ThreadFdTables {
    pub fn new(taint_stdin: bool) -> Self {
        Self {
            threads: HashMap::default(),
            taint_stdin,
        }
    }

    pub fn table(&mut self, tid: ThreadId) -> &mut FdTaintTable {
        let taint_stdin = self.taint_stdin;
        self.threads
            .entry(tid)
            .or_insert_with(|| FdTaintTable::new(taint_stdin))
    }

    pub fn is_tainted(&self, tid: ThreadId, fd: i32) -> bool {
        match self.threads.get(&tid) {
            Some(table) => table.is_tainted(fd),
            None => fd == 0 && self.taint_stdin,
        }
    }

    /// Forget every thread's table.
    pub fn reset(&mut self) {
        self.threads.clear();
    }
}
