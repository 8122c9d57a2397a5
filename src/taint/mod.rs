//! Deciding what becomes tainted when a syscall returns.
//!
//! Two independent rules, whose effects add up:
//!
//! * **descriptor taint**: descriptors opened on a taint source (a matching
//!   file, stdin, any socket) are remembered per thread, and everything read
//!   from them is tainted;
//! * **marker taint**: every occurrence of the configured marker string in
//!   data read from *any* descriptor is tainted, and nothing around it.

pub mod fd;
pub mod marker;

use crate::{
    config::Config,
    shadow::{ShadowMap, ShadowState},
    Addr,
};

use self::fd::{ThreadFdTables, ThreadId};

/// A buffer the kernel filled, as seen after the call: where it lives in the
/// program and what ended up in it. `data` may be shorter than what was
/// read (or empty) when the caller cannot see the bytes; only the marker
/// scan needs them.
#[derive(Clone, Copy, Debug)]
pub struct IoBuf<'a> {
    pub addr: Addr,
    pub data: &'a [u8],
}

impl<'a> IoBuf<'a> {
    pub fn new(addr: Addr, data: &'a [u8]) -> Self {
        Self { addr, data }
    }
}

/// The syscalls the taint policy cares about, with the arguments it needs.
/// The return value is passed separately.
#[derive(Clone, Copy, Debug)]
pub enum Syscall<'a> {
    /// Returns the new descriptor.
    Open { path: &'a [u8] },
    Close { fd: i32 },
    /// Returns the number of bytes read.
    Read { fd: i32, buf: IoBuf<'a> },
    RecvFrom { fd: i32, buf: IoBuf<'a> },
    /// Scatter read: the bytes fill `iov` in order.
    RecvMsg { fd: i32, iov: &'a [IoBuf<'a>] },
    /// Returns the new descriptor.
    Socket,
    /// Returns the new descriptor.
    Accept,
    Connect { fd: i32 },
    SocketPair { fds: [i32; 2] },
}

impl Syscall<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Syscall::Open { .. } => "open",
            Syscall::Close { .. } => "close",
            Syscall::Read { .. } => "read",
            Syscall::RecvFrom { .. } => "recvfrom",
            Syscall::RecvMsg { .. } => "recvmsg",
            Syscall::Socket => "socket",
            Syscall::Accept => "accept",
            Syscall::Connect { .. } => "connect",
            Syscall::SocketPair { .. } => "socketpair",
        }
    }
}

#[derive(Debug)]
pub struct TaintPolicy {
    fds: ThreadFdTables,
    marker: Option<Vec<u8>>,
    file_filter: Vec<u8>,
    taint_file: bool,
    taint_network: bool,
    taint_stdin: bool,
}

impl TaintPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            fds: ThreadFdTables::new(config.taint_stdin),
            marker: config
                .taint_string
                .as_ref()
                .map(|s| s.as_bytes().to_vec())
                .filter(|m| !m.is_empty()),
            file_filter: config.file_filter.as_bytes().to_vec(),
            taint_file: config.taint_file,
            taint_network: config.taint_network,
            taint_stdin: config.taint_stdin,
        }
    }

    pub fn is_fd_tainted(&self, tid: ThreadId, fd: i32) -> bool {
        self.fds.is_tainted(tid, fd)
    }

    /// Tainted descriptors of `tid`, ascending.
    pub fn tainted_fds(&mut self, tid: ThreadId) -> Vec<i32> {
        self.fds.table(tid).tainted().collect()
    }

    /// Forget all descriptor state, e.g. after the program `exec()`s.
    pub fn reset(&mut self) {
        self.fds.reset();
    }

    fn opened_file(&self, fd: i32, path: &[u8]) -> bool {
        (fd == 0 && self.taint_stdin) || (self.taint_file && path.starts_with(&self.file_filter))
    }

    /// Apply the policy to a syscall of thread `tid` that returned `result`.
    pub fn on_syscall_return(
        &mut self,
        shadow: &mut ShadowMap,
        tid: ThreadId,
        syscall: &Syscall<'_>,
        result: isize,
    ) {
        log::trace!("thread {tid}: {}() = {result}", syscall.name());
        match *syscall {
            Syscall::Open { path } => {
                let Ok(fd) = i32::try_from(result) else {
                    return;
                };
                if fd < 0 {
                    return;
                }
                let tainted = self.opened_file(fd, path);
                if tainted {
                    log::debug!(
                        "thread {tid}: tainting fd {fd} ({})",
                        String::from_utf8_lossy(path)
                    );
                }
                self.fds.table(tid).set(fd, tainted);
            }
            Syscall::Close { fd } => self.fds.table(tid).set(fd, false),
            Syscall::Socket | Syscall::Accept => {
                if let Ok(fd) = i32::try_from(result) {
                    self.taint_socket(tid, fd);
                }
            }
            Syscall::Connect { fd } => self.taint_socket(tid, fd),
            Syscall::SocketPair { fds } => {
                if result >= 0 {
                    for fd in fds {
                        self.taint_socket(tid, fd);
                    }
                }
            }
            Syscall::Read { fd, buf } | Syscall::RecvFrom { fd, buf } => {
                self.taint_read(shadow, tid, fd, std::slice::from_ref(&buf), result);
            }
            Syscall::RecvMsg { fd, iov } => self.taint_read(shadow, tid, fd, iov, result),
        }
    }

    fn taint_socket(&mut self, tid: ThreadId, fd: i32) {
        if self.taint_network && fd >= 0 {
            log::debug!("thread {tid}: tainting socket fd {fd}");
            self.fds.table(tid).set(fd, true);
        }
    }

    /// `result` bytes were read from `fd` into `bufs`, filling them in order.
    fn taint_read(
        &self,
        shadow: &mut ShadowMap,
        tid: ThreadId,
        fd: i32,
        bufs: &[IoBuf<'_>],
        result: isize,
    ) {
        let Ok(mut remaining) = usize::try_from(result) else {
            return;
        };
        if remaining == 0 || fd < 0 {
            return;
        }
        let fd_tainted = self.fds.is_tainted(tid, fd);
        for buf in bufs {
            if remaining == 0 {
                break;
            }
            // The length of each buffer is only known from what we were
            // shown; a single buffer takes the whole count.
            let len = if bufs.len() == 1 {
                remaining
            } else {
                remaining.min(buf.data.len())
            };
            if fd_tainted {
                shadow.set_range(buf.addr, len, ShadowState::Tainted);
            }
            if let Some(needle) = &self.marker {
                let data = &buf.data[..len.min(buf.data.len())];
                for span in marker::find_markers(data, needle) {
                    shadow.set_range(
                        buf.addr.saturating_add(span.start),
                        span.len(),
                        ShadowState::Tainted,
                    );
                }
            }
            remaining -= len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TID: ThreadId = 1;
    const BUF: Addr = 0x7000;

    fn setup(config: Config) -> (TaintPolicy, ShadowMap) {
        (TaintPolicy::new(&config), ShadowMap::new())
    }

    fn read(policy: &mut TaintPolicy, shadow: &mut ShadowMap, fd: i32, data: &[u8]) {
        let syscall = Syscall::Read {
            fd,
            buf: IoBuf::new(BUF, data),
        };
        policy.on_syscall_return(shadow, TID, &syscall, data.len() as isize);
    }

    #[test]
    fn matching_file_taints_exactly_what_was_read() {
        let (mut policy, mut shadow) = setup(Config {
            taint_file: true,
            file_filter: "/srv/in/".to_owned(),
            ..Config::default()
        });
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Open { path: b"/srv/in/a" }, 5);
        read(&mut policy, &mut shadow, 5, &[0; 10]);
        assert!(shadow.all(BUF, 10, ShadowState::Tainted));
        assert_eq!(shadow.get(BUF - 1), ShadowState::Untainted);
        assert_eq!(shadow.get(BUF + 10), ShadowState::Untainted);

        shadow.set_range(BUF, 10, ShadowState::Untainted);
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Close { fd: 5 }, 0);
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Open { path: b"/etc/passwd" }, 5);
        read(&mut policy, &mut shadow, 5, &[0; 10]);
        assert!(shadow.all(BUF, 10, ShadowState::Untainted));
    }

    #[test]
    fn empty_filter_matches_every_file() {
        let (mut policy, mut shadow) = setup(Config {
            taint_file: true,
            ..Config::default()
        });
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Open { path: b"/anything" }, 3);
        assert!(policy.is_fd_tainted(TID, 3));
        // Other threads have their own tables.
        assert!(!policy.is_fd_tainted(TID + 1, 3));
    }

    #[test]
    fn failed_and_empty_reads_taint_nothing() {
        let (mut policy, mut shadow) = setup(Config {
            taint_stdin: true,
            ..Config::default()
        });
        let syscall = Syscall::Read {
            fd: 0,
            buf: IoBuf::new(BUF, &[]),
        };
        policy.on_syscall_return(&mut shadow, TID, &syscall, -11);
        policy.on_syscall_return(&mut shadow, TID, &syscall, 0);
        assert_eq!(shadow.get(BUF), ShadowState::Untainted);
        // Without the bytes, the fd rule still applies to the whole count.
        policy.on_syscall_return(&mut shadow, TID, &syscall, 4);
        assert!(shadow.all(BUF, 4, ShadowState::Tainted));
    }

    #[test]
    fn sockets_follow_network_mode() {
        let (mut policy, mut shadow) = setup(Config {
            taint_network: true,
            ..Config::default()
        });
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Socket, 4);
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Accept, 6);
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Connect { fd: 7 }, 0);
        policy.on_syscall_return(&mut shadow, TID, &Syscall::SocketPair { fds: [8, 9] }, 0);
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Socket, -1);
        assert_eq!(policy.tainted_fds(TID), [4, 6, 7, 8, 9]);

        let (mut policy, mut shadow) = setup(Config::default());
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Socket, 4);
        assert!(!policy.is_fd_tainted(TID, 4));
    }

    #[test]
    fn marker_taints_only_its_own_bytes() {
        let (mut policy, mut shadow) = setup(Config {
            taint_string: Some("marker".to_owned()),
            ..Config::default()
        });
        read(&mut policy, &mut shadow, 3, b"AAAmarkerBBB");
        assert!(shadow.all(BUF, 3, ShadowState::Untainted));
        assert!(shadow.all(BUF + 3, 6, ShadowState::Tainted));
        assert!(shadow.all(BUF + 9, 3, ShadowState::Untainted));
    }

    #[test]
    fn marker_scan_stops_at_the_returned_length() {
        let (mut policy, mut shadow) = setup(Config {
            taint_string: Some("marker".to_owned()),
            ..Config::default()
        });
        let syscall = Syscall::RecvFrom {
            fd: 3,
            buf: IoBuf::new(BUF, b"AAAmarkerBBB"),
        };
        policy.on_syscall_return(&mut shadow, TID, &syscall, 8);
        assert_eq!(shadow.count(BUF, 12, ShadowState::Tainted), 0);
    }

    #[test]
    fn markers_at_the_top_of_the_address_space_are_clipped() {
        let (mut policy, mut shadow) = setup(Config {
            taint_string: Some("marker".to_owned()),
            ..Config::default()
        });
        let top = |addr, data: &'static [u8]| Syscall::Read {
            fd: 3,
            buf: IoBuf::new(addr, data),
        };
        policy.on_syscall_return(&mut shadow, TID, &top(usize::MAX - 1, b"AAmarker"), 8);
        assert_eq!(shadow.get(usize::MAX - 1), ShadowState::Untainted);
        assert_eq!(shadow.count(usize::MAX - 63, 63, ShadowState::Tainted), 0);

        policy.on_syscall_return(&mut shadow, TID, &top(usize::MAX - 4, b"marker"), 6);
        assert!(shadow.all(usize::MAX - 4, 4, ShadowState::Tainted));
        assert_eq!(shadow.get(usize::MAX - 5), ShadowState::Untainted);
    }

    #[test]
    fn recvmsg_fills_iovecs_in_order() {
        let (mut policy, mut shadow) = setup(Config {
            taint_network: true,
            ..Config::default()
        });
        policy.on_syscall_return(&mut shadow, TID, &Syscall::Socket, 3);
        let iov = [IoBuf::new(0x1000, &[0; 4]), IoBuf::new(0x2000, &[0; 8])];
        policy.on_syscall_return(&mut shadow, TID, &Syscall::RecvMsg { fd: 3, iov: &iov }, 6);
        assert!(shadow.all(0x1000, 4, ShadowState::Tainted));
        assert!(shadow.all(0x2000, 2, ShadowState::Tainted));
        assert_eq!(shadow.get(0x2002), ShadowState::Untainted);
    }
}
