//! Event-loop plumbing: the epoll dispatcher and the timer wheel.
//!
//! The supervisor is single-threaded; everything funnels through one epoll
//! set. Deadlines (kill escalation, crash backoff, runlevel grace) live in
//! a binary heap backed by a single timerfd armed to the earliest entry.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::registry::SvcKey;

/// Fixed event-loop tokens; dynamic sources (API connections, inetd
/// sockets) are allocated from [`FIRST_DYNAMIC`] upward.
pub const TOK_SIGNAL: u64 = 0;
/// Inotify instance token.
pub const TOK_INOTIFY: u64 = 1;
/// Timerfd token.
pub const TOK_TIMER: u64 = 2;
/// Control listener token.
pub const TOK_LISTENER: u64 = 3;
/// First token handed out to dynamic sources.
pub const FIRST_DYNAMIC: u64 = 16;

/// Thin wrapper over epoll keyed by u64 tokens.
pub struct Poller {
    epoll: Epoll,
}

impl Poller {
    /// Creates the epoll set.
    pub fn new() -> nix::Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
        })
    }

    /// Registers `fd` for readability under `token`.
    pub fn add(&self, fd: RawFd, token: u64) -> nix::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, token))
    }

    /// Switches write-interest on or off for `fd` (read stays on).
    pub fn set_writable(&self, fd: RawFd, token: u64, writable: bool) -> nix::Result<()> {
        let mut flags = EpollFlags::EPOLLIN;
        if writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.modify(borrowed, &mut EpollEvent::new(flags, token))
    }

    /// Removes `fd` from the set.
    pub fn delete(&self, fd: RawFd) -> nix::Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed)
    }

    /// Blocks until events arrive, retrying on EINTR. Returns
    /// (token, readable, writable) triples in kernel order.
    pub fn wait(&self, max: usize) -> nix::Result<Vec<(u64, bool, bool)>> {
        let mut events = vec![EpollEvent::empty(); max.max(1)];
        loop {
            match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => {
                    return Ok(events[..n]
                        .iter()
                        .map(|ev| {
                            let flags = ev.events();
                            (
                                ev.data(),
                                flags.intersects(
                                    EpollFlags::EPOLLIN
                                        | EpollFlags::EPOLLHUP
                                        | EpollFlags::EPOLLERR,
                                ),
                                flags.contains(EpollFlags::EPOLLOUT),
                            )
                        })
                        .collect());
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// What a fired deadline means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// STOPPING record passed its kill deadline; escalate to SIGKILL.
    Kill(SvcKey),
    /// CRASHED record finished its backoff; step it again.
    Backoff(SvcKey),
    /// Runlevel transition grace expired.
    Grace,
}

#[derive(Debug)]
struct Deadline {
    at: Instant,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deadline heap backed by one timerfd.
pub struct Timers {
    heap: BinaryHeap<Deadline>,
    tfd: TimerFd,
    seq: u64,
}

impl Timers {
    /// Creates the timer wheel.
    pub fn new() -> nix::Result<Self> {
        let tfd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )?;
        Ok(Self {
            heap: BinaryHeap::new(),
            tfd,
            seq: 0,
        })
    }

    /// Descriptor for event-loop registration.
    pub fn fd(&self) -> RawFd {
        self.tfd.as_fd().as_raw_fd()
    }

    /// Arms a deadline `after` from now.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.seq += 1;
        self.heap.push(Deadline {
            at: Instant::now() + after,
            seq: self.seq,
            kind,
        });
        self.rearm();
    }

    /// Pops every due deadline. Stale entries (e.g. a kill deadline for a
    /// record that already exited) are the caller's concern; firing is
    /// idempotent by design of the handlers.
    pub fn drain_due(&mut self) -> Vec<TimerKind> {
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.at > now {
                break;
            }
            if let Some(deadline) = self.heap.pop() {
                due.push(deadline.kind);
            }
        }
        self.rearm();
        due
    }

    /// Consumes the timerfd's expiration counter after a wakeup.
    pub fn drain_fd(&self) {
        let mut buf = [0u8; 8];
        // Nonblocking; EAGAIN just means the expiration raced a re-arm.
        unsafe {
            libc::read(self.fd(), buf.as_mut_ptr().cast(), buf.len());
        }
    }

    /// Drops pending deadlines matching `predicate`.
    pub fn cancel(&mut self, predicate: impl Fn(&TimerKind) -> bool) {
        let kept: Vec<Deadline> = self
            .heap
            .drain()
            .filter(|deadline| !predicate(&deadline.kind))
            .collect();
        self.heap = kept.into_iter().collect();
        self.rearm();
    }

    fn rearm(&self) {
        match self.heap.peek() {
            Some(head) => {
                let delay = head
                    .at
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(1));
                let _ = self.tfd.set(
                    Expiration::OneShot(TimeSpec::from_duration(delay)),
                    TimerSetTimeFlags::empty(),
                );
            }
            None => {
                let _ = self.tfd.unset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_fire_in_order() {
        let mut timers = Timers::new().unwrap();
        let key_a = SvcKey::new(1, "");
        let key_b = SvcKey::new(2, "");

        timers.arm(TimerKind::Backoff(key_b.clone()), Duration::from_millis(20));
        timers.arm(TimerKind::Kill(key_a.clone()), Duration::from_millis(1));

        std::thread::sleep(Duration::from_millis(40));
        let due = timers.drain_due();
        assert_eq!(
            due,
            vec![TimerKind::Kill(key_a), TimerKind::Backoff(key_b)]
        );
        assert!(timers.drain_due().is_empty());
    }

    #[test]
    fn cancel_removes_matching_deadlines() {
        let mut timers = Timers::new().unwrap();
        let key = SvcKey::new(1, "");
        timers.arm(TimerKind::Kill(key.clone()), Duration::from_millis(1));
        timers.arm(TimerKind::Grace, Duration::from_millis(1));

        timers.cancel(|kind| matches!(kind, TimerKind::Kill(k) if *k == key));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(timers.drain_due(), vec![TimerKind::Grace]);
    }

    #[test]
    fn ties_fire_in_arm_order() {
        let mut timers = Timers::new().unwrap();
        let a = SvcKey::new(1, "");
        let b = SvcKey::new(2, "");
        let at = Duration::from_millis(5);
        timers.arm(TimerKind::Backoff(a.clone()), at);
        timers.arm(TimerKind::Backoff(b.clone()), at);

        std::thread::sleep(Duration::from_millis(25));
        let due = timers.drain_due();
        assert_eq!(due, vec![TimerKind::Backoff(a), TimerKind::Backoff(b)]);
    }
}
