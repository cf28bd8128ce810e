//! On-demand service activation: spawning configured executables and
//! tracking the callers waiting for the service to take its name.
//!
//! Child processes are the one place worker threads are permitted: each
//! spawned child gets a reaper thread which blocks in `wait` and reports the
//! exit through a self-pipe the main loop watches.

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::num::NonZeroU32;
use std::os::unix::net::UnixStream;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use crate::error::Result;

use super::ConnId;

/// A service description loaded from a `.service` file: the well-known name
/// and the command line which provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFile {
    /// The well-known name the service will request.
    pub name: Box<str>,
    /// The command line to run, interpreted by the shell.
    pub exec: Box<str>,
}

impl ServiceFile {
    /// Parse the `key=value` body of a service file.
    ///
    /// Recognized keys are `Name` and `Exec` under the `[Service]` section
    /// header, which is itself optional.
    pub fn parse(contents: &str) -> Option<ServiceFile> {
        let mut name = None;
        let mut exec = None;

        for line in contents.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key.trim() {
                "Name" => name = Some(Box::from(value.trim())),
                "Exec" => exec = Some(Box::from(value.trim())),
                _ => {}
            }
        }

        Some(ServiceFile {
            name: name?,
            exec: exec?,
        })
    }
}

/// A caller blocked on an activation.
struct Waiter {
    conn: ConnId,
    serial: NonZeroU32,
}

/// An activation in flight: who waits for it and when it started, for the
/// timeout sweep.
struct Pending {
    waiters: Vec<Waiter>,
    started: Instant,
}

/// The completion report of a reaper thread.
pub(crate) struct ChildExit {
    pub(crate) name: Box<str>,
    pub(crate) status: std::io::Result<ExitStatus>,
}

/// The set of activatable services and the machinery to start them.
pub(crate) struct Activation {
    services: HashMap<Box<str>, ServiceFile>,
    env: HashMap<String, String>,
    pending: HashMap<Box<str>, Pending>,
    /// Read end of the self-pipe, watched by the main loop.
    notify_rx: UnixStream,
    /// Write end, cloned into each reaper thread.
    notify_tx: UnixStream,
    exits: Arc<Mutex<Vec<ChildExit>>>,
}

impl Activation {
    pub(crate) fn new(services: Vec<ServiceFile>) -> Result<Self> {
        let (notify_rx, notify_tx) = UnixStream::pair()?;
        notify_rx.set_nonblocking(true)?;

        let services = services
            .into_iter()
            .map(|service| (service.name.clone(), service))
            .collect();

        Ok(Self {
            services,
            env: HashMap::new(),
            pending: HashMap::new(),
            notify_rx,
            notify_tx,
            exits: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The read end of the self-pipe, for watch registration.
    pub(crate) fn notify_stream(&self) -> &UnixStream {
        &self.notify_rx
    }

    /// Whether a service file provides `name`.
    pub(crate) fn known(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Merge one variable into the activation environment.
    pub(crate) fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(String::from(key), String::from(value));
    }

    /// Spawn the executable providing `name` unless an activation is
    /// already in flight.
    pub(crate) fn start(&mut self, name: &str) -> Result<()> {
        if self.pending.contains_key(name) {
            return Ok(());
        }

        let Some(service) = self.services.get(name) else {
            return Ok(());
        };

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&*service.exec)
            .stdin(Stdio::null())
            .envs(&self.env);

        let mut child = command.spawn()?;

        info!(name, pid = child.id(), "activated service");

        let exits = Arc::clone(&self.exits);
        let mut notify = self.notify_tx.try_clone()?;
        let owned_name = service.name.clone();

        std::thread::spawn(move || {
            let status = child.wait();

            if let Ok(mut exits) = exits.lock() {
                exits.push(ChildExit {
                    name: owned_name,
                    status,
                });
            }

            let _ = notify.write(&[1]);
        });

        self.pending.insert(
            Box::from(name),
            Pending {
                waiters: Vec::new(),
                started: Instant::now(),
            },
        );

        Ok(())
    }

    /// Register a caller waiting for `name` to be activated.
    pub(crate) fn add_waiter(&mut self, name: &str, conn: ConnId, serial: NonZeroU32) {
        let pending = self
            .pending
            .entry(Box::from(name))
            .or_insert_with(|| Pending {
                waiters: Vec::new(),
                started: Instant::now(),
            });

        pending.waiters.push(Waiter { conn, serial });
    }

    /// Take the waiters of `name`, if an activation was in flight.
    pub(crate) fn take_pending(&mut self, name: &str) -> Vec<(ConnId, NonZeroU32)> {
        match self.pending.remove(name) {
            Some(pending) => pending
                .waiters
                .into_iter()
                .map(|waiter| (waiter.conn, waiter.serial))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The names with an activation in flight.
    pub(crate) fn pending_names(&self) -> Vec<Box<str>> {
        self.pending.keys().cloned().collect()
    }

    /// Whether any activation is in flight.
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The names whose activation has been in flight longer than `timeout`.
    pub(crate) fn stale_names(&self, timeout: std::time::Duration) -> Vec<Box<str>> {
        let now = Instant::now();

        self.pending
            .iter()
            .filter(|(_, pending)| {
                now.checked_duration_since(pending.started)
                    .is_some_and(|elapsed| elapsed > timeout)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop a disconnected caller from every pending activation.
    pub(crate) fn remove_conn(&mut self, conn: ConnId) {
        for pending in self.pending.values_mut() {
            pending.waiters.retain(|waiter| waiter.conn != conn);
        }
    }

    /// Drain the self-pipe and collect the reaped children.
    pub(crate) fn reap(&mut self) -> Vec<ChildExit> {
        let mut sink = [0u8; 64];

        loop {
            match self.notify_rx.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        match self.exits.lock() {
            Ok(mut exits) => exits.drain(..).collect(),
            Err(error) => {
                warn!("activation reaper mutex poisoned: {error}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ServiceFile;

    #[test]
    fn parse_service_file() {
        let service = ServiceFile::parse(
            "# activation file\n[Service]\nName=com.example.Echo\nExec=/usr/bin/echo-daemon --flag\n",
        )
        .unwrap();

        assert_eq!(&*service.name, "com.example.Echo");
        assert_eq!(&*service.exec, "/usr/bin/echo-daemon --flag");
    }

    #[test]
    fn parse_requires_name_and_exec() {
        assert!(ServiceFile::parse("Name=com.example.Echo\n").is_none());
        assert!(ServiceFile::parse("Exec=/bin/true\n").is_none());
    }
}
