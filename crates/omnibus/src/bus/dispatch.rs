//! Routing of one received message: sender assignment, driver fast path,
//! destination lookup, match fan-out, and the all-or-nothing commit.

use std::num::NonZeroU32;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::Error;
use crate::proto::Flags;
use crate::{BodyBuf, Message, MessageBuf};

use super::driver::{DRIVER_INTERFACE, DRIVER_NAME, DRIVER_PATH, err};
use super::txn::Transaction;
use super::{Broker, ConnId};

/// The terminal outcomes of routing one message.
pub(crate) enum DispatchError {
    /// An allocation failed; the transaction rolls back and the sender gets
    /// its reserved out-of-memory reply.
    NoMemory,
    /// The peer violated the protocol and must be dropped.
    Disconnect,
    /// A logical error reported to the sender as an error reply.
    Wire {
        name: &'static str,
        detail: String,
    },
}

impl From<Error> for DispatchError {
    fn from(error: Error) -> Self {
        if error.is_no_memory() {
            return DispatchError::NoMemory;
        }

        DispatchError::Wire {
            name: err::FAILED,
            detail: error.to_string(),
        }
    }
}

/// The result of dispatching the queue of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchStatus {
    /// The queue was drained.
    Complete,
    /// Memory pressure interrupted dispatch; retry after the back-off.
    NeedMemory,
    /// The connection went away.
    Gone,
}

impl Broker {
    /// Dispatch buffered inbound messages of `id` until the queue drains or
    /// something interrupts it.
    pub(crate) fn dispatch_conn(&mut self, id: ConnId) -> DispatchStatus {
        loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                return DispatchStatus::Gone;
            };

            // Re-reserve the OOM reply if the previous one was consumed; if
            // even that fails, back off before touching the queue.
            if conn.oom_reply.is_none() {
                let reply = self.make_oom_reply();

                let Some(conn) = self.conns.get_mut(&id) else {
                    return DispatchStatus::Gone;
                };

                match self.mem.reserve(reply.size_hint()) {
                    Ok(()) => conn.oom_reply = Some(reply),
                    Err(_) => return DispatchStatus::NeedMemory,
                }
            }

            let Some(conn) = self.conns.get_mut(&id) else {
                return DispatchStatus::Gone;
            };

            let Some(message) = conn.inbound.pop_front() else {
                return DispatchStatus::Complete;
            };

            match self.dispatch_message(id, message) {
                Ok(()) => {}
                Err(status) => return status,
            }
        }
    }

    /// Route one message per the transaction discipline: stage every
    /// enqueue, then commit atomically or cancel on memory pressure.
    fn dispatch_message(
        &mut self,
        sender: ConnId,
        mut message: MessageBuf,
    ) -> Result<(), DispatchStatus> {
        let Some(conn) = self.conns.get(&sender) else {
            return Err(DispatchStatus::Gone);
        };

        let registered = conn.registered;

        if registered {
            if let Some(unique) = conn.unique_name() {
                message.set_sender(unique);
            }
        }

        let serial = message.serial();
        let no_reply = message.flags().contains(Flags::NO_REPLY_EXPECTED);
        let message = Rc::new(message);

        let mut txn = Transaction::new();
        let result = self.route(sender, registered, &message, &mut txn);

        match result {
            Ok(()) => {
                let touched = txn.touched();
                let ops = txn.commit(&self.mem, &mut self.conns);

                for op in ops {
                    self.apply_op(op);
                }

                for id in touched {
                    self.update_interest(id);
                }

                self.check_activations();
                Ok(())
            }
            Err(DispatchError::NoMemory) => {
                txn.cancel(&self.mem);

                debug!(
                    conn = sender.0,
                    reserved = self.mem.used(),
                    "transaction rolled back under memory pressure"
                );

                self.send_oom_reply(sender, serial);
                Err(DispatchStatus::NeedMemory)
            }
            Err(DispatchError::Wire { name, detail }) => {
                txn.cancel(&self.mem);

                debug!(conn = sender.0, error = name, "routing failed: {detail}");

                if !no_reply {
                    self.send_error_reply(sender, &message, name, &detail);
                }

                Ok(())
            }
            Err(DispatchError::Disconnect) => {
                txn.cancel(&self.mem);
                self.disconnect(sender);
                Err(DispatchStatus::Gone)
            }
        }
    }

    /// Steps 1–4 of routing: driver fast path, destination lookup, match
    /// fan-out.
    fn route(
        &mut self,
        sender: ConnId,
        registered: bool,
        message: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let destination = message.destination().map(Box::<str>::from);

        let addressed = if destination.as_deref() == Some(DRIVER_NAME) {
            if !self
                .policy
                .check_send(message.sender(), Some(DRIVER_NAME), message)
            {
                return Err(DispatchError::Wire {
                    name: err::ACCESS_DENIED,
                    detail: String::from("Policy denied access to the bus driver"),
                });
            }

            self.driver_handle(sender, message, txn)?;
            None
        } else if !registered {
            // Peers must complete Hello before anything may be routed.
            return Err(DispatchError::Disconnect);
        } else if let Some(destination) = destination.as_deref() {
            let Some(owner) = self.names.lookup(destination) else {
                return Err(DispatchError::Wire {
                    name: err::SERVICE_DOES_NOT_EXIST,
                    detail: format!("Service {destination:?} does not exist"),
                });
            };

            let owner_unique = self.unique_of(owner);

            if self
                .policy
                .check_send(message.sender(), Some(&owner_unique), message)
            {
                self.stage_to_id(txn, owner, message.clone())?;
            } else {
                trace!(conn = sender.0, "policy dropped unicast message");
            }

            Some(owner)
        } else {
            None
        };

        // Broadcast: ask the match store for additional recipients.
        if registered {
            self.stage_matches(txn, message, Some(sender), addressed)?;
        }

        Ok(())
    }

    /// Stage one enqueue per match-rule recipient, applying the policy per
    /// recipient with denied recipients silently skipped.
    pub(crate) fn stage_matches(
        &mut self,
        txn: &mut Transaction,
        message: &Rc<MessageBuf>,
        exclude_sender: Option<ConnId>,
        exclude_addressed: Option<ConnId>,
    ) -> Result<(), DispatchError> {
        let recipients = self
            .matches
            .recipients(message, exclude_sender, exclude_addressed);

        for recipient in recipients {
            let unique = self.unique_of(recipient);

            if !self
                .policy
                .check_send(message.sender(), Some(&unique), message)
            {
                continue;
            }

            self.stage_to_id(txn, recipient, message.clone())?;
        }

        Ok(())
    }

    /// Stage `message` for `target`, reserving quota and pool bytes.
    pub(crate) fn stage_to_id(
        &mut self,
        txn: &mut Transaction,
        target: ConnId,
        message: Rc<MessageBuf>,
    ) -> Result<(), DispatchError> {
        let Broker {
            conns, mem, limits, ..
        } = self;

        let Some(conn) = conns.get_mut(&target) else {
            return Ok(());
        };

        txn.send(mem, limits, conn, message)
            .map_err(|_| DispatchError::NoMemory)
    }

    /// Stage an owned, locally built message for `target`.
    pub(crate) fn stage_to(
        &mut self,
        txn: &mut Transaction,
        target: ConnId,
        message: MessageBuf,
    ) -> Result<(), DispatchError> {
        self.stage_to_id(txn, target, Rc::new(message))
    }

    /// Stage a method return carrying `body` for the sender of `call`.
    pub(crate) fn stage_reply(
        &mut self,
        txn: &mut Transaction,
        target: ConnId,
        call: &MessageBuf,
        body: BodyBuf,
    ) -> Result<(), DispatchError> {
        if call.flags().contains(Flags::NO_REPLY_EXPECTED) {
            return Ok(());
        }

        let serial = self.next_serial();

        let reply = call
            .borrow()
            .method_return(serial)
            .with_sender(DRIVER_NAME)
            .with_body(body.as_body())
            .to_owned();

        self.stage_to(txn, target, reply)
    }

    /// Stage a `NameAcquired` signal directed at the connection gaining a
    /// name.
    pub(crate) fn stage_name_acquired(
        &mut self,
        txn: &mut Transaction,
        target: ConnId,
        target_unique: &str,
        name: &str,
    ) -> Result<(), DispatchError> {
        let signal = self.driver_signal("NameAcquired", target_unique, name)?;
        self.stage_to(txn, target, signal)
    }

    /// Stage a `NameLost` signal directed at the connection losing a name.
    pub(crate) fn stage_name_lost(
        &mut self,
        txn: &mut Transaction,
        target: ConnId,
        target_unique: &str,
        name: &str,
    ) -> Result<(), DispatchError> {
        let signal = self.driver_signal("NameLost", target_unique, name)?;
        self.stage_to(txn, target, signal)
    }

    /// Stage a `NameOwnerChanged` broadcast to every subscribed connection.
    pub(crate) fn stage_name_owner_changed(
        &mut self,
        txn: &mut Transaction,
        name: &str,
        old: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), DispatchError> {
        let mut body = BodyBuf::new();
        body.store(name)?;
        body.store(old.unwrap_or(""))?;
        body.store(new.unwrap_or(""))?;

        let serial = self.next_serial();

        let signal = Message::signal(DRIVER_PATH, "NameOwnerChanged", serial)
            .with_interface(DRIVER_INTERFACE)
            .with_sender(DRIVER_NAME)
            .with_body(body.as_body())
            .to_owned();

        let signal = Rc::new(signal);
        self.stage_matches(txn, &signal, None, None)
    }

    /// Build one of the driver's directed name signals.
    fn driver_signal(
        &mut self,
        member: &str,
        destination: &str,
        name: &str,
    ) -> Result<MessageBuf, DispatchError> {
        let mut body = BodyBuf::new();
        body.store(name)?;

        let serial = self.next_serial();

        Ok(Message::signal(DRIVER_PATH, member, serial)
            .with_interface(DRIVER_INTERFACE)
            .with_sender(DRIVER_NAME)
            .with_destination(destination)
            .with_body(body.as_body())
            .to_owned())
    }

    /// Send a logical error reply outside of the failed transaction.
    fn send_error_reply(
        &mut self,
        target: ConnId,
        call: &Rc<MessageBuf>,
        name: &'static str,
        detail: &str,
    ) {
        let mut body = BodyBuf::new();

        if body.store(detail).is_err() {
            return;
        }

        let serial = self.next_serial();

        let reply = call
            .borrow()
            .error(name, serial)
            .with_sender(DRIVER_NAME)
            .with_body(body.as_body())
            .to_owned();

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
                self.send_oom_reply(target, call.serial());
            }
        }
    }

    /// Deliver the reserved out-of-memory reply, which requires no further
    /// allocation or quota.
    pub(crate) fn send_oom_reply(&mut self, target: ConnId, reply_serial: NonZeroU32) {
        // Re-stamp the reserved reply so serials stay in send order.
        let serial = self.next_serial();

        let Some(conn) = self.conns.get_mut(&target) else {
            return;
        };

        let Some(mut reply) = conn.take_oom_reply(reply_serial) else {
            return;
        };

        reply.serial = serial;
        conn.out_reserved += reply.size_hint();
        conn.outgoing.push_back(Rc::new(reply));
        self.update_interest(target);
    }

    /// Construct a fresh out-of-memory reply skeleton. The reply serial and
    /// destination are filled in when it is sent.
    pub(crate) fn make_oom_reply(&mut self) -> MessageBuf {
        let serial = self.next_serial();

        MessageBuf {
            kind: crate::message::OwnedMessageKind::Error {
                error_name: Box::from(err::NO_MEMORY),
                reply_serial: NonZeroU32::MIN,
            },
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: Some(Box::from(DRIVER_NAME)),
            body: BodyBuf::new(),
        }
    }
}
