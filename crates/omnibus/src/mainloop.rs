//! The single-threaded cooperative event loop.
//!
//! One loop owns every watch, timeout and dispatchable connection of a
//! broker. The loop itself is a readiness engine: [`MainLoop::wait`] polls
//! and returns what fired, and the owner processes the events, re-checking
//! [`MainLoop::serial`] and [`MainLoop::depth`] between events so that a
//! handler which mutates the callback list or re-enters the loop restarts
//! the iteration instead of acting on stale state.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use omnibus_core::raw_set;

use crate::error::Result;

raw_set! {
    /// The readiness conditions a watch subscribes to.
    #[repr(u8)]
    pub enum Interest {
        /// Not interested in anything; the watch is skipped.
        NONE = 0,
        /// The file descriptor is readable.
        READABLE = 1,
        /// The file descriptor is writable.
        WRITABLE = 2,
    }
}

/// Identifies the resource an [`Event`] fired for, assigned by the owner of
/// the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// A handle to a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchId(usize);

/// A handle to a registered timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutId(usize);

/// An event returned by [`MainLoop::wait`].
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// A watched file descriptor became ready.
    Ready {
        /// The token of the watch.
        token: Token,
        /// The descriptor is readable.
        readable: bool,
        /// The descriptor is writable.
        writable: bool,
        /// The peer hung up or the descriptor is in an error state.
        hangup: bool,
    },
    /// A timeout fired.
    Timeout {
        /// The token of the timeout.
        token: Token,
    },
}

struct Watch {
    fd: RawFd,
    interest: Interest,
    enabled: bool,
    /// The handler ran out of memory last time this watch fired. The watch
    /// is skipped for one iteration and the poll timeout clamped to the OOM
    /// back-off so it is retried promptly.
    oom: bool,
    token: Token,
}

struct Timeout {
    interval: Duration,
    last: Instant,
    enabled: bool,
    token: Token,
}

/// How long to wait before retrying an operation that failed for lack of
/// memory.
const OOM_WAIT: Duration = Duration::from_millis(500);

/// The poll-based event loop.
pub struct MainLoop {
    watches: Vec<Option<Watch>>,
    timeouts: Vec<Option<Timeout>>,
    /// Bumped when the watch or timeout lists change, so that in-flight
    /// event processing can detect the mutation and restart.
    serial: u64,
    /// Number of nested [`enter`]s; [`quit`] decrements it.
    ///
    /// [`enter`]: Self::enter
    /// [`quit`]: Self::quit
    depth: usize,
    /// Connections with buffered inbound messages waiting for dispatch.
    dispatch: VecDeque<Token>,
}

impl MainLoop {
    /// Construct a new empty loop.
    pub fn new() -> Self {
        Self {
            watches: Vec::new(),
            timeouts: Vec::new(),
            serial: 0,
            depth: 0,
            dispatch: VecDeque::new(),
        }
    }

    /// The mutation serial of the callback lists.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The current nesting depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Enter the loop, returning the depth at which [`running`] stops
    /// reporting `true`.
    ///
    /// [`running`]: Self::running
    pub fn enter(&mut self) -> usize {
        let exit = self.depth;
        self.depth += 1;
        exit
    }

    /// Test whether a loop entered at `exit_depth` should keep iterating.
    pub fn running(&self, exit_depth: usize) -> bool {
        self.depth != exit_depth
    }

    /// Leave the innermost loop.
    pub fn quit(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth = self.depth.saturating_sub(1);
    }

    /// The back-off to sleep for when an operation fails for lack of
    /// memory.
    pub fn oom_wait(&self) -> Duration {
        OOM_WAIT
    }

    /// Register a watch on a file descriptor.
    pub fn add_watch(&mut self, fd: RawFd, interest: Interest, token: Token) -> WatchId {
        self.serial = self.serial.wrapping_add(1);

        let watch = Watch {
            fd,
            interest,
            enabled: true,
            oom: false,
            token,
        };

        for (index, slot) in self.watches.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(watch);
                return WatchId(index);
            }
        }

        self.watches.push(Some(watch));
        WatchId(self.watches.len() - 1)
    }

    /// Remove a watch.
    pub fn remove_watch(&mut self, id: WatchId) {
        self.serial = self.serial.wrapping_add(1);
        self.watches[id.0] = None;
    }

    /// Change the readiness conditions a watch subscribes to.
    pub fn set_interest(&mut self, id: WatchId, interest: Interest) {
        if let Some(watch) = self.watches[id.0].as_mut() {
            watch.interest = interest;
        }
    }

    /// Enable or disable a watch without removing it.
    pub fn set_watch_enabled(&mut self, id: WatchId, enabled: bool) {
        if let Some(watch) = self.watches[id.0].as_mut() {
            watch.enabled = enabled;
        }
    }

    /// Flag that the handler of a watch ran out of memory.
    pub fn flag_watch_oom(&mut self, id: WatchId) {
        if let Some(watch) = self.watches[id.0].as_mut() {
            watch.oom = true;
        }
    }

    /// Register a repeating timeout.
    pub fn add_timeout(&mut self, interval: Duration, token: Token) -> TimeoutId {
        self.serial = self.serial.wrapping_add(1);

        let timeout = Timeout {
            interval,
            last: Instant::now(),
            enabled: true,
            token,
        };

        for (index, slot) in self.timeouts.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(timeout);
                return TimeoutId(index);
            }
        }

        self.timeouts.push(Some(timeout));
        TimeoutId(self.timeouts.len() - 1)
    }

    /// Remove a timeout.
    pub fn remove_timeout(&mut self, id: TimeoutId) {
        self.serial = self.serial.wrapping_add(1);
        self.timeouts[id.0] = None;
    }

    /// Enable or disable a timeout, re-basing its interval when enabling.
    pub fn set_timeout_enabled(&mut self, id: TimeoutId, enabled: bool) {
        if let Some(timeout) = self.timeouts[id.0].as_mut() {
            if enabled && !timeout.enabled {
                timeout.last = Instant::now();
            }

            timeout.enabled = enabled;
        }
    }

    /// Queue a connection for dispatch.
    ///
    /// Queued tokens make [`wait`] poll without blocking until the queue is
    /// drained again.
    ///
    /// [`wait`]: Self::wait
    pub fn queue_dispatch(&mut self, token: Token) {
        if !self.dispatch.contains(&token) {
            self.dispatch.push_back(token);
        }
    }

    /// Take the next queued dispatch token.
    pub fn take_dispatch(&mut self) -> Option<Token> {
        self.dispatch.pop_front()
    }

    /// Re-queue a token at the front of the dispatch queue.
    pub fn requeue_dispatch(&mut self, token: Token) {
        self.dispatch.push_front(token);
    }

    /// Test if any connection waits for dispatch.
    pub fn has_dispatch(&self) -> bool {
        !self.dispatch.is_empty()
    }

    /// Drop a token from the dispatch queue.
    pub fn cancel_dispatch(&mut self, token: Token) {
        self.dispatch.retain(|t| *t != token);
    }

    /// Poll the registered watches and timeouts once and collect what
    /// fired.
    ///
    /// When `block` is false, or a dispatch is pending, the poll returns
    /// immediately. Watches whose OOM flag is set are skipped for this
    /// iteration, their flag is cleared, and the poll timeout is clamped to
    /// the OOM back-off.
    pub fn wait(&mut self, block: bool) -> Result<Vec<Event>> {
        let mut fds = Vec::new();
        let mut indexes = Vec::new();
        let mut oom_pending = false;

        for (index, slot) in self.watches.iter_mut().enumerate() {
            let Some(watch) = slot.as_mut() else {
                continue;
            };

            if watch.oom {
                watch.oom = false;
                oom_pending = true;
                continue;
            }

            if !watch.enabled || watch.interest == Interest::NONE {
                continue;
            }

            let mut events = 0i16;

            if watch.interest.contains(Interest::READABLE) {
                events |= libc::POLLIN;
            }

            if watch.interest.contains(Interest::WRITABLE) {
                events |= libc::POLLOUT;
            }

            fds.push(libc::pollfd {
                fd: watch.fd,
                events,
                revents: 0,
            });

            indexes.push(index);
        }

        let mut timeout = self.next_timeout(Instant::now());

        if !block || !self.dispatch.is_empty() {
            timeout = Some(Duration::ZERO);
        }

        if oom_pending {
            timeout = Some(timeout.map_or(OOM_WAIT, |t| t.min(OOM_WAIT)));
        }

        let timeout_ms = match timeout {
            Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        // SAFETY: The pollfd slice is valid for the duration of the call.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        if ready < 0 {
            let error = io::Error::last_os_error();

            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }

            return Err(error.into());
        }

        let mut events = Vec::new();

        // Process fired timeouts before ready descriptors, like the poll
        // order of the callbacks themselves.
        let now = Instant::now();

        for slot in self.timeouts.iter_mut() {
            let Some(timeout) = slot.as_mut() else {
                continue;
            };

            if !timeout.enabled {
                continue;
            }

            if check_timeout(timeout, now).is_none() {
                timeout.last = now;
                events.push(Event::Timeout {
                    token: timeout.token,
                });
            }
        }

        if ready > 0 {
            for (pollfd, index) in fds.iter().zip(indexes) {
                if pollfd.revents == 0 {
                    continue;
                }

                let Some(watch) = self.watches[index].as_ref() else {
                    continue;
                };

                if !watch.enabled {
                    continue;
                }

                events.push(Event::Ready {
                    token: watch.token,
                    readable: pollfd.revents & libc::POLLIN != 0,
                    writable: pollfd.revents & libc::POLLOUT != 0,
                    hangup: pollfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
                });
            }
        }

        Ok(events)
    }

    /// The minimum remaining interval among enabled timeouts, re-basing any
    /// timeout whose recorded last firing lies in the future.
    fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        let mut min = None;

        for slot in self.timeouts.iter_mut() {
            let Some(timeout) = slot.as_mut() else {
                continue;
            };

            if !timeout.enabled {
                continue;
            }

            let remaining = match check_timeout(timeout, now) {
                Some(remaining) => remaining,
                None => Duration::ZERO,
            };

            min = Some(match min {
                Some(min) => remaining.min(min),
                None => remaining,
            });

            if min == Some(Duration::ZERO) {
                break;
            }
        }

        min
    }
}

/// The time remaining until `timeout` expires, or `None` if it has expired.
///
/// When the recorded last firing is in the future of `now` the clock was set
/// backward; the timeout is re-based one full interval into the future and
/// does not fire this iteration.
fn check_timeout(timeout: &mut Timeout, now: Instant) -> Option<Duration> {
    let Some(elapsed) = now.checked_duration_since(timeout.last) else {
        timeout.last = now;
        return Some(timeout.interval);
    };

    let remaining = timeout.interval.saturating_sub(elapsed);

    if remaining.is_zero() {
        return None;
    }

    Some(remaining)
}

impl Default for MainLoop {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use super::{Event, Interest, MainLoop, Token};

    #[test]
    fn watch_readiness() {
        let (mut a, b) = UnixStream::pair().unwrap();

        let mut mainloop = MainLoop::new();
        mainloop.add_watch(b.as_raw_fd(), Interest::READABLE, Token(7));

        let events = mainloop.wait(false).unwrap();
        assert!(events.is_empty());

        a.write_all(b"x").unwrap();

        let events = mainloop.wait(true).unwrap();
        assert!(matches!(
            events[..],
            [Event::Ready {
                token: Token(7),
                readable: true,
                ..
            }]
        ));
    }

    #[test]
    fn disabled_watch_does_not_fire() {
        let (mut a, b) = UnixStream::pair().unwrap();

        let mut mainloop = MainLoop::new();
        let id = mainloop.add_watch(b.as_raw_fd(), Interest::READABLE, Token(7));
        mainloop.set_watch_enabled(id, false);

        a.write_all(b"x").unwrap();

        let events = mainloop.wait(false).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn timeout_fires_after_interval() {
        let mut mainloop = MainLoop::new();
        mainloop.add_timeout(Duration::from_millis(10), Token(3));

        let start = Instant::now();

        loop {
            let events = mainloop.wait(true).unwrap();

            if let [Event::Timeout { token: Token(3) }] = events[..] {
                break;
            }

            assert!(start.elapsed() < Duration::from_secs(5), "timeout never fired");
        }

        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn dispatch_queue_makes_wait_nonblocking() {
        let mut mainloop = MainLoop::new();
        mainloop.queue_dispatch(Token(1));
        mainloop.queue_dispatch(Token(1));
        mainloop.queue_dispatch(Token(2));

        let start = Instant::now();
        mainloop.wait(true).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(mainloop.take_dispatch(), Some(Token(1)));
        assert_eq!(mainloop.take_dispatch(), Some(Token(2)));
        assert_eq!(mainloop.take_dispatch(), None);
    }

    #[test]
    fn mutation_bumps_serial() {
        let (_a, b) = UnixStream::pair().unwrap();

        let mut mainloop = MainLoop::new();
        let before = mainloop.serial();
        let id = mainloop.add_watch(b.as_raw_fd(), Interest::READABLE, Token(1));
        assert_ne!(mainloop.serial(), before);

        let before = mainloop.serial();
        mainloop.remove_watch(id);
        assert_ne!(mainloop.serial(), before);
    }

    #[test]
    fn depth_tracks_enter_and_quit() {
        let mut mainloop = MainLoop::new();
        let exit = mainloop.enter();
        assert!(mainloop.running(exit));
        mainloop.quit();
        assert!(!mainloop.running(exit));
    }
}
