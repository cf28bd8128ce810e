use std::collections::HashMap;
use std::rc::Rc;

use crate::MessageBuf;
use crate::error::{Error, Result};

use super::conn::Conn;
use super::driver::NameFlag;
use super::matches::MatchRule;
use super::mem::MemPool;
use super::{ConnId, Limits};

/// A registry mutation staged on a transaction and applied at commit.
#[derive(Debug)]
pub(crate) enum RegistryOp {
    /// Bind the freshly minted unique name of a connection completing
    /// Hello.
    SetUnique { conn: ConnId, name: Box<str> },
    /// Bind a vacant well-known name.
    Bind {
        name: Box<str>,
        conn: ConnId,
        flags: NameFlag,
    },
    /// Displace the owner of a well-known name.
    Replace {
        name: Box<str>,
        old: ConnId,
        new: ConnId,
        flags: NameFlag,
        requeue_old: bool,
    },
    /// Update the flags of the current owner.
    UpdateFlags {
        name: Box<str>,
        conn: ConnId,
        flags: NameFlag,
    },
    /// Append a connection to the waiter queue of a name.
    Enqueue {
        name: Box<str>,
        conn: ConnId,
        flags: NameFlag,
    },
    /// Release a name, promoting the next waiter if the owner released.
    Release { name: Box<str>, conn: ConnId },
    /// Add a match rule.
    AddMatch { conn: ConnId, rule: MatchRule },
    /// Remove a match rule by its text.
    RemoveMatch { conn: ConnId, text: Box<str> },
    /// Register a connection waiting for a service activation to complete.
    ActivationWait {
        name: Box<str>,
        conn: ConnId,
        serial: std::num::NonZeroU32,
    },
}

/// A staged enqueue: the recipient, the message, and the bytes reserved for
/// it.
struct StagedSend {
    conn: ConnId,
    message: Rc<MessageBuf>,
    bytes: usize,
}

/// An all-or-nothing batch of outbound enqueues and registry mutations.
///
/// Staging a send reserves bytes against both the shared memory pool and the
/// recipient's outgoing quota, so that [`commit`] cannot fail: either every
/// staged operation becomes visible, or [`cancel`] returns every reservation
/// and nothing does.
///
/// [`commit`]: Self::commit
/// [`cancel`]: Self::cancel
pub(crate) struct Transaction {
    sends: Vec<StagedSend>,
    ops: Vec<RegistryOp>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            sends: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Stage one enqueue of `message` to `conn`.
    ///
    /// Fails with a memory error when the recipient's quota or the shared
    /// pool is exhausted, leaving previously staged operations intact for
    /// the caller to cancel.
    pub(crate) fn send(
        &mut self,
        mem: &MemPool,
        limits: &Limits,
        conn: &mut Conn,
        message: Rc<MessageBuf>,
    ) -> Result<()> {
        let bytes = message.size_hint();
        let staged: usize = self
            .sends
            .iter()
            .filter(|send| send.conn == conn.id)
            .map(|send| send.bytes)
            .sum();

        if conn.out_reserved + staged + bytes > limits.max_outgoing_bytes {
            return Err(Error::no_memory());
        }

        mem.reserve(bytes)?;

        self.sends.push(StagedSend {
            conn: conn.id,
            message,
            bytes,
        });

        Ok(())
    }

    /// Stage a registry mutation.
    pub(crate) fn push_op(&mut self, op: RegistryOp) {
        self.ops.push(op);
    }

    /// Whether any operation has been staged.
    pub(crate) fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.ops.is_empty()
    }

    /// Commit every staged enqueue into its recipient's outgoing queue and
    /// hand the registry mutations back for application.
    ///
    /// A recipient which disconnected between staging and commit forfeits
    /// its copy; its reservation is returned.
    pub(crate) fn commit(
        self,
        mem: &MemPool,
        conns: &mut HashMap<ConnId, Conn>,
    ) -> Vec<RegistryOp> {
        for staged in self.sends {
            match conns.get_mut(&staged.conn) {
                Some(conn) => {
                    conn.out_reserved += staged.bytes;
                    conn.outgoing.push_back(staged.message);
                }
                None => mem.release(staged.bytes),
            }
        }

        self.ops
    }

    /// Discard every staged operation, returning all reservations.
    pub(crate) fn cancel(self, mem: &MemPool) {
        for staged in self.sends {
            mem.release(staged.bytes);
        }
    }

    /// The connections which have a send staged, in staging order without
    /// duplicates.
    pub(crate) fn touched(&self) -> Vec<ConnId> {
        let mut touched = Vec::new();

        for staged in &self.sends {
            if !touched.contains(&staged.conn) {
                touched.push(staged.conn);
            }
        }

        touched
    }
}
