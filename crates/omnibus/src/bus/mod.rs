//! The broker: connection lifecycle, routing, names, matches and policy,
//! driven by the cooperative main loop.

pub use self::activation::ServiceFile;
pub(crate) mod activation;

pub use self::matches::MatchRule;
pub(crate) mod matches;

pub use self::policy::{Policy, PolicyRule};
pub(crate) mod policy;

pub use self::driver::{
    DRIVER_INTERFACE, DRIVER_NAME, NameFlag, NameReply, ReleaseNameReply, StartServiceReply, err,
};
pub(crate) mod driver;

pub(crate) mod conn;
pub(crate) mod dispatch;
pub(crate) mod mem;
pub(crate) mod names;
pub(crate) mod txn;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::ExitStatus;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mainloop::{Event, Interest, MainLoop, TimeoutId, Token};
use crate::{Address, MessageBuf};

use self::activation::Activation;
use self::conn::{Conn, Input};
use self::dispatch::DispatchStatus;
use self::driver::err as error_name;
use self::matches::MatchStore;
use self::mem::MemPool;
use self::names::NameRegistry;
use self::txn::{RegistryOp, Transaction};

/// Identifies one connection for the lifetime of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnId(pub(crate) u32);

const TOKEN_KIND_MASK: u64 = 3 << 62;
const TOKEN_KIND_CONN: u64 = 1 << 62;
const TOKEN_KIND_LISTENER: u64 = 2 << 62;
const TOKEN_KIND_ACTIVATION: u64 = 3 << 62;

/// The token of the activation self-pipe watch.
const ACTIVATION_PIPE_TOKEN: Token = Token(TOKEN_KIND_ACTIVATION);
/// The token of the activation timeout sweep.
const ACTIVATION_TIMEOUT_TOKEN: Token = Token(TOKEN_KIND_ACTIVATION | 1);

fn conn_token(id: ConnId) -> Token {
    Token(TOKEN_KIND_CONN | u64::from(id.0))
}

fn conn_of(token: Token) -> Option<ConnId> {
    if token.0 & TOKEN_KIND_MASK == TOKEN_KIND_CONN {
        Some(ConnId(token.0 as u32))
    } else {
        None
    }
}

fn listener_of(token: Token) -> Option<usize> {
    if token.0 & TOKEN_KIND_MASK == TOKEN_KIND_LISTENER {
        Some((token.0 & !TOKEN_KIND_MASK) as usize)
    } else {
        None
    }
}

/// Resource limits applied to every connection.
#[derive(Debug, Clone)]
pub struct Limits {
    /// How many unframed inbound bytes may be buffered before reads pause.
    pub max_incoming_bytes: usize,
    /// How many outbound bytes may be queued per connection.
    pub max_outgoing_bytes: usize,
    /// The largest accepted marshalled message.
    pub max_message_size: usize,
    /// How many match rules one connection may hold.
    pub max_match_rules: usize,
    /// How long to sleep before retrying after an allocation failure.
    pub oom_backoff: Duration,
    /// How long a service activation may stay pending.
    pub activation_timeout: Duration,
    /// A cap on the bytes queued across all connections.
    pub mem_capacity: Option<usize>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_incoming_bytes: 1 << 20,
            max_outgoing_bytes: 1 << 20,
            max_message_size: 1 << 25,
            max_match_rules: 512,
            oom_backoff: Duration::from_millis(500),
            activation_timeout: Duration::from_secs(25),
            mem_capacity: None,
        }
    }
}

/// The configuration a broker is constructed from.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    /// The addresses to listen on.
    pub addresses: Vec<Address>,
    /// The security policy.
    pub policy: Policy,
    /// Activatable services.
    pub services: Vec<ServiceFile>,
    /// Resource limits.
    pub limits: Limits,
}

struct Listener {
    listener: UnixListener,
    address: Address,
}

/// A message bus broker: accepts connections, names them, and routes typed
/// messages between them under the configured policy.
///
/// The broker is strictly single-threaded; [`run()`] drives everything on
/// the calling thread, and [`turn()`] performs a single iteration for
/// callers who embed the loop.
///
/// [`run()`]: Self::run
/// [`turn()`]: Self::turn
pub struct Broker {
    mainloop: MainLoop,
    listeners: Vec<Listener>,
    pub(crate) conns: HashMap<ConnId, Conn>,
    pub(crate) names: NameRegistry,
    pub(crate) matches: MatchStore,
    pub(crate) policy: Policy,
    pub(crate) limits: Limits,
    pub(crate) mem: MemPool,
    pub(crate) activation: Activation,
    activation_timeout: TimeoutId,
    next_conn: u32,
    serial: u32,
    guid: Box<str>,
}

impl Broker {
    /// Construct a broker, binding every configured listen address.
    pub fn new(config: BusConfig) -> Result<Self> {
        let mut mainloop = MainLoop::new();
        let mut listeners = Vec::new();

        for (index, address) in config.addresses.iter().enumerate() {
            let Address::Unix { path } = address;

            // A stale socket file from a previous run would make bind fail.
            let _ = std::fs::remove_file(path);

            let listener = UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;

            mainloop.add_watch(
                listener.as_raw_fd(),
                Interest::READABLE,
                Token(TOKEN_KIND_LISTENER | index as u64),
            );

            info!(%address, "listening");

            listeners.push(Listener {
                listener,
                address: address.clone(),
            });
        }

        let activation = Activation::new(config.services)?;

        mainloop.add_watch(
            activation.notify_stream().as_raw_fd(),
            Interest::READABLE,
            ACTIVATION_PIPE_TOKEN,
        );

        let activation_timeout =
            mainloop.add_timeout(Duration::from_secs(1), ACTIVATION_TIMEOUT_TOKEN);
        mainloop.set_timeout_enabled(activation_timeout, false);

        Ok(Self {
            mainloop,
            listeners,
            conns: HashMap::new(),
            names: NameRegistry::new(),
            matches: MatchStore::new(),
            policy: config.policy,
            mem: MemPool::new(config.limits.mem_capacity),
            limits: config.limits,
            activation,
            activation_timeout,
            next_conn: 0,
            serial: 0,
            guid: generate_guid(),
        })
    }

    /// The addresses the broker is listening on.
    pub fn addresses(&self) -> Vec<Address> {
        self.listeners
            .iter()
            .map(|listener| listener.address.clone())
            .collect()
    }

    /// Adopt an already-connected stream as a peer, as the accept path does
    /// for incoming connections.
    pub fn add_peer(&mut self, stream: UnixStream) -> Result<()> {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;

        let oom_reply = self.make_oom_reply();
        self.mem.reserve(oom_reply.size_hint())?;

        let fd = stream.as_raw_fd();
        let watch = self.mainloop.add_watch(fd, Interest::READABLE, conn_token(id));

        let conn = match Conn::new(id, stream, watch, self.guid.clone(), oom_reply) {
            Ok(conn) => conn,
            Err(error) => {
                self.mainloop.remove_watch(watch);
                return Err(error);
            }
        };

        debug!(conn = id.0, "accepted connection");
        self.conns.insert(id, conn);
        Ok(())
    }

    /// Run the loop until [`quit()`] is called.
    ///
    /// [`quit()`]: Self::quit
    pub fn run(&mut self) -> Result<()> {
        let exit = self.mainloop.enter();

        while self.mainloop.running(exit) {
            self.turn(true)?;
        }

        Ok(())
    }

    /// Leave the innermost [`run()`].
    ///
    /// [`run()`]: Self::run
    pub fn quit(&mut self) {
        self.mainloop.quit();
    }

    /// Perform one loop iteration: poll, process what fired, and drain the
    /// dispatch queue.
    pub fn turn(&mut self, block: bool) -> Result<()> {
        let serial = self.mainloop.serial();
        let depth = self.mainloop.depth();

        let events = self.mainloop.wait(block)?;

        for event in events {
            // A handler that mutated the callback list or re-entered the
            // loop invalidates the rest of this batch.
            if self.mainloop.serial() != serial || self.mainloop.depth() != depth {
                break;
            }

            match event {
                Event::Timeout { token } => self.handle_timeout(token),
                Event::Ready {
                    token,
                    readable,
                    writable,
                    hangup,
                } => self.handle_ready(token, readable, writable, hangup),
            }
        }

        self.dispatch_pending();
        Ok(())
    }

    /// The next serial for broker-originated messages.
    pub(crate) fn next_serial(&mut self) -> NonZeroU32 {
        loop {
            if let Some(serial) = NonZeroU32::new(self.serial.wrapping_add(1)) {
                self.serial = serial.get();
                break serial;
            }

            self.serial = 0;
        }
    }

    /// The unique name of a connection, or the empty string when it has
    /// none.
    pub(crate) fn unique_of(&self, id: ConnId) -> Box<str> {
        self.conns
            .get(&id)
            .and_then(|conn| conn.unique_name())
            .map(Box::from)
            .unwrap_or_default()
    }

    fn handle_timeout(&mut self, token: Token) {
        if token == ACTIVATION_TIMEOUT_TOKEN {
            self.activation_sweep();
        }
    }

    fn handle_ready(&mut self, token: Token, readable: bool, writable: bool, hangup: bool) {
        if token == ACTIVATION_PIPE_TOKEN {
            self.handle_child_exits();
            return;
        }

        if let Some(index) = listener_of(token) {
            self.accept_all(index);
            return;
        }

        let Some(id) = conn_of(token) else {
            return;
        };

        if writable {
            if !self.flush_conn(id) {
                return;
            }
        }

        if readable || hangup {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };

            match conn.handle_input(&self.limits) {
                Ok(Input::Idle) => {}
                Ok(Input::NeedsDispatch) => self.mainloop.queue_dispatch(token),
                Ok(Input::Disconnect) => {
                    self.disconnect(id);
                    return;
                }
                Err(error) => {
                    debug!(conn = id.0, "dropping malformed peer: {error}");
                    self.disconnect(id);
                    return;
                }
            }
        }

        self.update_interest(id);
    }

    /// Flush pending outbound bytes of `id`.
    ///
    /// Returns `false` when the connection was dropped.
    fn flush_conn(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else {
            return false;
        };

        let before = conn.out_reserved;

        match conn.flush() {
            Ok(alive) => {
                let released = before - conn.out_reserved;
                self.mem.release(released);

                if !alive {
                    self.disconnect(id);
                    return false;
                }

                true
            }
            Err(error) => {
                debug!(conn = id.0, "write failed: {error}");
                let released = before.saturating_sub(
                    self.conns.get(&id).map_or(0, |conn| conn.out_reserved),
                );
                self.mem.release(released);
                self.disconnect(id);
                false
            }
        }
    }

    fn accept_all(&mut self, index: usize) {
        loop {
            let result = match self.listeners.get(index) {
                Some(listener) => listener.listener.accept(),
                None => return,
            };

            match result {
                Ok((stream, _)) => {
                    if let Err(error) = self.add_peer(stream) {
                        warn!("failed to adopt connection: {error}");
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!("accept failed: {error}");
                    break;
                }
            }
        }
    }

    /// Drain the dispatch queue, giving every queued connection one
    /// dispatch pass. Memory pressure backs off and retries once before the
    /// connection is re-queued for the next iteration.
    fn dispatch_pending(&mut self) {
        let mut pending = Vec::new();

        while let Some(token) = self.mainloop.take_dispatch() {
            pending.push(token);
        }

        for token in pending {
            let Some(id) = conn_of(token) else {
                continue;
            };

            match self.dispatch_conn(id) {
                DispatchStatus::Complete => self.update_interest(id),
                DispatchStatus::Gone => {}
                DispatchStatus::NeedMemory => {
                    std::thread::sleep(self.limits.oom_backoff);

                    match self.dispatch_conn(id) {
                        DispatchStatus::Complete => self.update_interest(id),
                        DispatchStatus::Gone => {}
                        DispatchStatus::NeedMemory => self.mainloop.queue_dispatch(token),
                    }
                }
            }
        }
    }

    /// Recompute the watch interest of a connection from its buffer state.
    pub(crate) fn update_interest(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };

        let mut interest = Interest::NONE;

        if !conn.input_throttled(&self.limits) {
            interest |= Interest::READABLE;
        }

        if conn.wants_write() {
            interest |= Interest::WRITABLE;
        }

        self.mainloop.set_interest(conn.watch, interest);
    }

    /// Apply one committed registry mutation.
    pub(crate) fn apply_op(&mut self, op: RegistryOp) {
        match op {
            RegistryOp::SetUnique { conn, name } => {
                self.names.bind(&name, conn, NameFlag::NONE);

                if let Some(state) = self.conns.get_mut(&conn) {
                    state.registered = true;
                    state.unique = Some(name);
                }
            }
            RegistryOp::Bind { name, conn, flags } => {
                self.names.bind(&name, conn, flags);

                if let Some(state) = self.conns.get_mut(&conn) {
                    state.names.insert(name);
                }
            }
            RegistryOp::Replace {
                name,
                old,
                new,
                flags,
                requeue_old,
            } => {
                self.names.replace(&name, old, new, flags, requeue_old);

                if let Some(state) = self.conns.get_mut(&old) {
                    state.names.remove(&name);
                }

                if let Some(state) = self.conns.get_mut(&new) {
                    state.names.insert(name);
                }
            }
            RegistryOp::UpdateFlags { name, conn, flags } => {
                self.names.update_flags(&name, conn, flags);
            }
            RegistryOp::Enqueue { name, conn, flags } => {
                self.names.enqueue(&name, conn, flags);
            }
            RegistryOp::Release { name, conn } => {
                let promoted = self.names.release(&name, conn);

                if let Some(state) = self.conns.get_mut(&conn) {
                    state.names.remove(&name);
                }

                if let Some((next, _)) = promoted {
                    if let Some(state) = self.conns.get_mut(&next) {
                        state.names.insert(name);
                    }
                }
            }
            RegistryOp::AddMatch { conn, rule } => {
                self.matches.add(conn, rule);
            }
            RegistryOp::RemoveMatch { conn, text } => {
                self.matches.remove(conn, &text);
            }
            RegistryOp::ActivationWait { name, conn, serial } => {
                self.activation.add_waiter(&name, conn, serial);
                self.mainloop
                    .set_timeout_enabled(self.activation_timeout, true);
            }
        }
    }

    /// Resolve pending activations whose name has been acquired.
    pub(crate) fn check_activations(&mut self) {
        for name in self.activation.pending_names() {
            if self.names.lookup(&name).is_none() {
                continue;
            }

            for (conn, serial) in self.activation.take_pending(&name) {
                self.send_start_reply(conn, serial, Ok(StartServiceReply::SUCCESS));
            }
        }

        if !self.activation.has_pending() {
            self.mainloop
                .set_timeout_enabled(self.activation_timeout, false);
        }
    }

    /// Report reaped activation children which exited before taking their
    /// name.
    fn handle_child_exits(&mut self) {
        for exit in self.activation.reap() {
            let waiters = self.activation.take_pending(&exit.name);

            if waiters.is_empty() {
                continue;
            }

            let (name, detail) = spawn_failure(&exit.name, &exit.status);
            warn!("activation of {} failed: {detail}", exit.name);

            for (conn, serial) in waiters {
                self.send_start_reply(conn, serial, Err((name, detail.clone())));
            }
        }

        if !self.activation.has_pending() {
            self.mainloop
                .set_timeout_enabled(self.activation_timeout, false);
        }
    }

    /// Fail activations that have been pending past the timeout.
    fn activation_sweep(&mut self) {
        for name in self.activation.stale_names(self.limits.activation_timeout) {
            for (conn, serial) in self.activation.take_pending(&name) {
                self.send_start_reply(
                    conn,
                    serial,
                    Err((
                        error_name::NO_REPLY,
                        format!("Activation of {name} timed out"),
                    )),
                );
            }
        }

        if !self.activation.has_pending() {
            self.mainloop
                .set_timeout_enabled(self.activation_timeout, false);
        }
    }

    /// Send the deferred reply of a `StartServiceByName` call.
    fn send_start_reply(
        &mut self,
        target: ConnId,
        reply_serial: NonZeroU32,
        result: std::result::Result<StartServiceReply, (&'static str, String)>,
    ) {
        use crate::message::OwnedMessageKind;
        use crate::proto::Flags;

        let serial = self.next_serial();
        let destination = self.unique_of(target);

        let mut body = crate::BodyBuf::new();

        let kind = match result {
            Ok(code) => {
                if body.store(code.get()).is_err() {
                    return;
                }

                OwnedMessageKind::MethodReturn { reply_serial }
            }
            Err((name, detail)) => {
                if body.store(&*detail).is_err() {
                    return;
                }

                OwnedMessageKind::Error {
                    error_name: Box::from(name),
                    reply_serial,
                }
            }
        };

        let reply = MessageBuf {
            kind,
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: Some(destination),
            sender: Some(Box::from(DRIVER_NAME)),
            body,
        };

        let mut txn = Transaction::new();

        match self.stage_to(&mut txn, target, reply) {
            Ok(()) => {
                let touched = txn.touched();
                let ops = txn.commit(&self.mem, &mut self.conns);
                debug_assert!(ops.is_empty());

                for id in touched {
                    self.update_interest(id);
                }
            }
            Err(_) => {
                txn.cancel(&self.mem);
                self.send_oom_reply(target, reply_serial);
            }
        }
    }

    /// Drop a connection: drain its state, release every name it owned and
    /// emit the resulting `NameOwnerChanged` signals in one transaction.
    pub(crate) fn disconnect(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };

        info!(conn = id.0, unique = conn.unique_name(), "disconnected");

        self.mainloop.remove_watch(conn.watch);
        self.mainloop.cancel_dispatch(conn_token(id));
        self.matches.remove_conn(id);
        self.names.remove_from_queues(id);
        self.activation.remove_conn(id);

        let mut released = conn.reserved_bytes();

        if let Some(reply) = &conn.oom_reply {
            released += reply.size_hint();
        }

        self.mem.release(released);

        let unique = conn.unique.clone();
        let owned: Vec<Box<str>> = conn.names.iter().cloned().collect();
        drop(conn);

        let Some(unique) = unique else {
            return;
        };

        let mut txn = Transaction::new();
        let mut staging_ok = true;

        for name in &owned {
            let promoted = self.names.release(name, id);

            match promoted {
                Some((next, _)) => {
                    if let Some(state) = self.conns.get_mut(&next) {
                        state.names.insert(name.clone());
                    }

                    let next_unique = self.unique_of(next);

                    if staging_ok {
                        staging_ok = self
                            .stage_name_acquired(&mut txn, next, &next_unique, name)
                            .is_ok()
                            && self
                                .stage_name_owner_changed(
                                    &mut txn,
                                    name,
                                    Some(&unique),
                                    Some(&next_unique),
                                )
                                .is_ok();
                    }
                }
                None => {
                    if staging_ok {
                        staging_ok = self
                            .stage_name_owner_changed(&mut txn, name, Some(&unique), None)
                            .is_ok();
                    }
                }
            }
        }

        self.names.release(&unique, id);

        if staging_ok {
            staging_ok = self
                .stage_name_owner_changed(&mut txn, &unique, Some(&unique), None)
                .is_ok();
        }

        if staging_ok {
            let touched = txn.touched();
            let ops = txn.commit(&self.mem, &mut self.conns);
            debug_assert!(ops.is_empty());

            for touched_id in touched {
                self.update_interest(touched_id);
            }
        } else {
            // Name bindings were already released; under memory pressure the
            // observers lose the signals but never the consistency.
            txn.cancel(&self.mem);
        }
    }
}

/// Describe a failed activation child.
fn spawn_failure(
    name: &str,
    status: &std::io::Result<ExitStatus>,
) -> (&'static str, String) {
    use std::os::unix::process::ExitStatusExt;

    match status {
        Ok(status) => match status.signal() {
            Some(signal) => (
                error_name::SPAWN_CHILD_SIGNALED,
                format!("Process {name} was killed by signal {signal}"),
            ),
            None => (
                error_name::SPAWN_CHILD_EXITED,
                format!(
                    "Process {name} exited with status {} before taking its name",
                    status.code().unwrap_or(-1)
                ),
            ),
        },
        Err(error) => (
            error_name::SPAWN_FAILED,
            format!("Waiting for {name} failed: {error}"),
        ),
    }
}

/// Generate the server GUID advertised during authentication.
fn generate_guid() -> Box<str> {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    format!(
        "{:08x}{:08x}{:08x}{:08x}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed),
        now.as_secs() as u32,
        now.subsec_nanos(),
    )
    .into()
}
