//! The method handlers of the bus driver: the broker's own service, reached
//! at the well-known name instead of being routed to a peer.

use std::rc::Rc;

use omnibus_core::{raw_enum, raw_set};
use tracing::debug;

use crate::error::ErrorKind;
use crate::{Basic, BodyBuf, MessageBuf, MessageKind, ObjectPath, Signature};

use super::dispatch::DispatchError;
use super::txn::{RegistryOp, Transaction};
use super::{Broker, ConnId};

/// The well-known name of the bus driver.
pub const DRIVER_NAME: &str = "org.freedesktop.DBus";

/// The interface of the bus driver.
pub const DRIVER_INTERFACE: &str = "org.freedesktop.DBus";

/// The object path of the bus driver.
pub(crate) const DRIVER_PATH: &ObjectPath = ObjectPath::new_const(b"/org/freedesktop/DBus");

/// Error names surfaced on the wire in error replies.
pub mod err {
    /// An allocation failed while routing; the sender sees this reply.
    pub const NO_MEMORY: &str = "org.freedesktop.DBus.Error.NoMemory";
    /// The destination name has no owner and cannot be activated.
    pub const SERVICE_DOES_NOT_EXIST: &str = "org.freedesktop.DBus.Error.ServiceDoesNotExist";
    /// A name lookup found no owner.
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    /// No reply arrived within the allotted time.
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    /// The security policy denied the operation.
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    /// Driver method arguments did not match the expected signature.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// A malformed address string.
    pub const BAD_ADDRESS: &str = "org.freedesktop.DBus.Error.BadAddress";
    /// A malformed signature.
    pub const INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
    /// The driver has no such method.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// A catch-all failure.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// A match rule did not parse.
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    /// No match rule with the given text was found.
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    /// A per-connection resource limit was hit.
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    /// An activated child exited before taking its name.
    pub const SPAWN_CHILD_EXITED: &str = "org.freedesktop.DBus.Error.Spawn.ChildExited";
    /// An activated child was killed by a signal.
    pub const SPAWN_CHILD_SIGNALED: &str = "org.freedesktop.DBus.Error.Spawn.ChildSignaled";
    /// The activation executable could not be run.
    pub const SPAWN_EXEC_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.ExecFailed";
    /// Activation failed for another reason.
    pub const SPAWN_FAILED: &str = "org.freedesktop.DBus.Error.Spawn.Failed";
}

raw_set! {
    /// The flags of a `RequestName` call.
    #[repr(u32)]
    pub enum NameFlag {
        /// No flags.
        NONE = 0,
        /// Allow later requesters to take the name over.
        ALLOW_REPLACEMENT = 1,
        /// Displace the current owner if it allowed replacement.
        REPLACE_EXISTING = 2,
        /// Fail instead of queueing when the name is taken.
        DO_NOT_QUEUE = 4,
    }
}

raw_enum! {
    /// The reply code of a `RequestName` call.
    #[repr(u32)]
    pub enum NameReply {
        /// The caller is now the primary owner.
        PRIMARY_OWNER = 1,
        /// The name is taken; the caller was appended to its queue.
        IN_QUEUE = 2,
        /// The name is taken and the caller declined to queue.
        EXISTS = 3,
        /// The caller already owns the name.
        ALREADY_OWNER = 4,
    }
}

raw_enum! {
    /// The reply code of a `ReleaseName` call.
    #[repr(u32)]
    pub enum ReleaseNameReply {
        /// The caller gave the name up, or left its queue.
        RELEASED = 1,
        /// The name was not bound at all.
        NON_EXISTENT = 2,
        /// The name is bound, but not to the caller.
        NOT_OWNER = 3,
    }
}

raw_enum! {
    /// The reply code of a `StartServiceByName` call.
    #[repr(u32)]
    pub enum StartServiceReply {
        /// The service was started.
        SUCCESS = 1,
        /// The service already had an owner.
        ALREADY_RUNNING = 2,
    }
}

fn invalid_args(detail: impl Into<String>) -> DispatchError {
    DispatchError::Wire {
        name: err::INVALID_ARGS,
        detail: detail.into(),
    }
}

/// Whether `name` is a syntactically valid well-known name.
pub(crate) fn valid_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 || name.starts_with(':') {
        return false;
    }

    let mut elements = 0;

    for element in name.split('.') {
        if element.is_empty() || element.starts_with(|c: char| c.is_ascii_digit()) {
            return false;
        }

        if !element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return false;
        }

        elements += 1;
    }

    elements >= 2
}

impl Broker {
    /// Handle a message addressed to the bus driver.
    pub(crate) fn driver_handle(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let MessageKind::MethodCall { member, .. } = msg.kind() else {
            // Signals addressed to the bus are tolerated and dropped.
            return Ok(());
        };

        if let Some(interface) = msg.interface() {
            if interface != DRIVER_INTERFACE {
                return Err(DispatchError::Wire {
                    name: err::UNKNOWN_METHOD,
                    detail: format!("No such interface {interface}"),
                });
            }
        }

        let registered = self
            .conns
            .get(&sender)
            .is_some_and(|conn| conn.registered);

        if !registered && member != "Hello" {
            return Err(DispatchError::Disconnect);
        }

        debug!(conn = sender.0, member, "driver call");

        match member {
            "Hello" => self.driver_hello(sender, msg, txn),
            "RequestName" => self.driver_request_name(sender, msg, txn),
            "ReleaseName" => self.driver_release_name(sender, msg, txn),
            "ListNames" => self.driver_list_names(sender, msg, txn),
            "NameHasOwner" => self.driver_name_has_owner(sender, msg, txn),
            "GetNameOwner" => self.driver_get_name_owner(sender, msg, txn),
            "AddMatch" => self.driver_add_match(sender, msg, txn),
            "RemoveMatch" => self.driver_remove_match(sender, msg, txn),
            "StartServiceByName" => self.driver_start_service(sender, msg, txn),
            "UpdateActivationEnvironment" => self.driver_update_environment(sender, msg, txn),
            "GetConnectionUnixUser" => self.driver_get_unix_user(sender, msg, txn),
            member => Err(DispatchError::Wire {
                name: err::UNKNOWN_METHOD,
                detail: format!("No such method {member}"),
            }),
        }
    }

    fn driver_hello(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let Some(conn) = self.conns.get(&sender) else {
            return Ok(());
        };

        if conn.registered {
            // A second Hello is a protocol violation.
            return Err(DispatchError::Disconnect);
        }

        let unique = self.names.mint_unique();

        let mut body = BodyBuf::new();
        body.store(&*unique)?;

        let serial = self.next_serial();
        let reply = msg
            .borrow()
            .method_return(serial)
            .with_sender(DRIVER_NAME)
            .with_destination(&unique)
            .with_body(body.as_body())
            .to_owned();

        self.stage_to(txn, sender, reply)?;
        self.stage_name_acquired(txn, sender, &unique, &unique)?;
        self.stage_name_owner_changed(txn, &unique, None, Some(&unique))?;

        txn.push_op(RegistryOp::SetUnique {
            conn: sender,
            name: unique,
        });

        Ok(())
    }

    fn driver_request_name(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let (name, flags) = string_u32_args(msg)?;
        let flags = NameFlag::new(flags);

        if !valid_well_known_name(name) {
            return Err(invalid_args(format!("Cannot acquire name {name:?}")));
        }

        if !self.policy.check_own(name) {
            return Err(DispatchError::Wire {
                name: err::ACCESS_DENIED,
                detail: format!("Owning {name:?} is denied by policy"),
            });
        }

        let unique = self.unique_of(sender);

        /// What the registry state implies for this request.
        enum Decision {
            Vacant,
            AlreadyOwner,
            Replace { old: ConnId, requeue_old: bool },
            Exists,
            Queue,
        }

        let decision = match self.names.entry(name) {
            None => Decision::Vacant,
            Some(entry) if entry.owner == sender => Decision::AlreadyOwner,
            Some(entry)
                if entry.flags.contains(NameFlag::ALLOW_REPLACEMENT)
                    && flags.contains(NameFlag::REPLACE_EXISTING) =>
            {
                Decision::Replace {
                    old: entry.owner,
                    requeue_old: !entry.flags.contains(NameFlag::DO_NOT_QUEUE),
                }
            }
            Some(_) if flags.contains(NameFlag::DO_NOT_QUEUE) => Decision::Exists,
            Some(_) => Decision::Queue,
        };

        let outcome = match decision {
            Decision::Vacant => {
                txn.push_op(RegistryOp::Bind {
                    name: Box::from(name),
                    conn: sender,
                    flags,
                });

                self.stage_name_acquired(txn, sender, &unique, name)?;
                self.stage_name_owner_changed(txn, name, None, Some(&unique))?;
                NameReply::PRIMARY_OWNER
            }
            Decision::AlreadyOwner => {
                txn.push_op(RegistryOp::UpdateFlags {
                    name: Box::from(name),
                    conn: sender,
                    flags,
                });

                NameReply::ALREADY_OWNER
            }
            Decision::Replace { old, requeue_old } => {
                let old_unique = self.unique_of(old);

                txn.push_op(RegistryOp::Replace {
                    name: Box::from(name),
                    old,
                    new: sender,
                    flags,
                    requeue_old,
                });

                self.stage_name_lost(txn, old, &old_unique, name)?;
                self.stage_name_acquired(txn, sender, &unique, name)?;
                self.stage_name_owner_changed(txn, name, Some(&old_unique), Some(&unique))?;
                NameReply::PRIMARY_OWNER
            }
            Decision::Exists => NameReply::EXISTS,
            Decision::Queue => {
                txn.push_op(RegistryOp::Enqueue {
                    name: Box::from(name),
                    conn: sender,
                    flags,
                });

                NameReply::IN_QUEUE
            }
        };

        let mut body = BodyBuf::new();
        body.store(outcome.get())?;
        self.stage_reply(txn, sender, msg, body)
    }

    fn driver_release_name(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let name = string_arg(msg)?;

        if !valid_well_known_name(name) {
            return Err(invalid_args(format!("Cannot release name {name:?}")));
        }

        let unique = self.unique_of(sender);

        /// What the registry state implies for this release.
        enum Decision {
            NonExistent,
            Owner { promoted: Option<ConnId> },
            Queued,
            NotOwner,
        }

        let decision = match self.names.entry(name) {
            None => Decision::NonExistent,
            Some(entry) if entry.owner == sender => Decision::Owner {
                promoted: entry.queue.front().map(|(conn, _)| *conn),
            },
            Some(entry) if entry.queue.iter().any(|(conn, _)| *conn == sender) => {
                Decision::Queued
            }
            Some(_) => Decision::NotOwner,
        };

        let outcome = match decision {
            Decision::NonExistent => ReleaseNameReply::NON_EXISTENT,
            Decision::Owner { promoted } => {
                txn.push_op(RegistryOp::Release {
                    name: Box::from(name),
                    conn: sender,
                });

                self.stage_name_lost(txn, sender, &unique, name)?;

                match promoted {
                    Some(next) => {
                        let next_unique = self.unique_of(next);
                        self.stage_name_acquired(txn, next, &next_unique, name)?;
                        self.stage_name_owner_changed(
                            txn,
                            name,
                            Some(&unique),
                            Some(&next_unique),
                        )?;
                    }
                    None => {
                        self.stage_name_owner_changed(txn, name, Some(&unique), None)?;
                    }
                }

                ReleaseNameReply::RELEASED
            }
            Decision::Queued => {
                txn.push_op(RegistryOp::Release {
                    name: Box::from(name),
                    conn: sender,
                });

                ReleaseNameReply::RELEASED
            }
            Decision::NotOwner => ReleaseNameReply::NOT_OWNER,
        };

        let mut body = BodyBuf::new();
        body.store(outcome.get())?;
        self.stage_reply(txn, sender, msg, body)
    }

    fn driver_list_names(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        no_args(msg)?;

        let mut body = BodyBuf::new();

        {
            let mut w = body.writer();
            w.open_array(Signature::STRING)?;
            w.write_basic(Basic::Str(DRIVER_NAME))?;

            for name in self.names.names() {
                w.write_basic(Basic::Str(name))?;
            }

            w.close_array()?;
            w.finish()?;
        }

        self.stage_reply(txn, sender, msg, body)
    }

    fn driver_name_has_owner(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let name = string_arg(msg)?;
        let has = name == DRIVER_NAME || self.names.lookup(name).is_some();

        let mut body = BodyBuf::new();
        body.store(has)?;
        self.stage_reply(txn, sender, msg, body)
    }

    fn driver_get_name_owner(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let name = string_arg(msg)?;

        let owner = if name == DRIVER_NAME {
            Box::from(DRIVER_NAME)
        } else {
            match self.names.lookup(name) {
                Some(conn) => self.unique_of(conn),
                None => {
                    return Err(DispatchError::Wire {
                        name: err::NAME_HAS_NO_OWNER,
                        detail: format!("Name {name:?} has no owner"),
                    });
                }
            }
        };

        let mut body = BodyBuf::new();
        body.store(&*owner)?;
        self.stage_reply(txn, sender, msg, body)
    }

    fn driver_add_match(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let text = string_arg(msg)?;

        let rule = super::matches::MatchRule::parse(text).map_err(|_| DispatchError::Wire {
            name: err::MATCH_RULE_INVALID,
            detail: format!("Cannot parse match rule {text:?}"),
        })?;

        if self.matches.count(sender) >= self.limits.max_match_rules {
            return Err(DispatchError::Wire {
                name: err::LIMITS_EXCEEDED,
                detail: String::from("Too many match rules for this connection"),
            });
        }

        txn.push_op(RegistryOp::AddMatch { conn: sender, rule });
        self.stage_reply(txn, sender, msg, BodyBuf::new())
    }

    fn driver_remove_match(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let text = string_arg(msg)?;

        if !self.matches.has(sender, text) {
            return Err(DispatchError::Wire {
                name: err::MATCH_RULE_NOT_FOUND,
                detail: format!("No match rule {text:?} to remove"),
            });
        }

        txn.push_op(RegistryOp::RemoveMatch {
            conn: sender,
            text: Box::from(text),
        });

        self.stage_reply(txn, sender, msg, BodyBuf::new())
    }

    fn driver_start_service(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let (name, _flags) = string_u32_args(msg)?;

        if !valid_well_known_name(name) {
            return Err(invalid_args(format!("Cannot activate name {name:?}")));
        }

        if self.names.lookup(name).is_some() {
            let mut body = BodyBuf::new();
            body.store(StartServiceReply::ALREADY_RUNNING.get())?;
            return self.stage_reply(txn, sender, msg, body);
        }

        if !self.activation.known(name) {
            return Err(DispatchError::Wire {
                name: err::SERVICE_DOES_NOT_EXIST,
                detail: format!("No service file provides {name:?}"),
            });
        }

        if let Err(error) = self.activation.start(name) {
            return Err(DispatchError::Wire {
                name: err::SPAWN_EXEC_FAILED,
                detail: format!("Failed to start {name:?}: {error}"),
            });
        }

        // The reply is deferred until the child requests the name, exits, or
        // the activation timeout expires.
        txn.push_op(RegistryOp::ActivationWait {
            name: Box::from(name),
            conn: sender,
            serial: msg.serial(),
        });

        Ok(())
    }

    fn driver_update_environment(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        if msg.signature() != "a{ss}" {
            return Err(invalid_args("Expected an array of string pairs"));
        }

        let body = msg.body();
        let reader = body.reader();

        match reader.recurse() {
            Ok(mut entries) => loop {
                let mut entry = entries.recurse().map_err(|e| invalid_args(e.to_string()))?;

                let key = entry
                    .read_basic()
                    .map_err(|e| invalid_args(e.to_string()))?;
                entry.next().map_err(|e| invalid_args(e.to_string()))?;
                let value = entry
                    .read_basic()
                    .map_err(|e| invalid_args(e.to_string()))?;

                if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
                    self.activation.set_env(key, value);
                }

                if !entries.next().map_err(|e| invalid_args(e.to_string()))? {
                    break;
                }
            },
            // An empty dict is an empty update.
            Err(error) if matches!(error.kind(), ErrorKind::EmptyArray) => {}
            Err(error) => return Err(invalid_args(error.to_string())),
        }

        self.stage_reply(txn, sender, msg, BodyBuf::new())
    }

    fn driver_get_unix_user(
        &mut self,
        sender: ConnId,
        msg: &Rc<MessageBuf>,
        txn: &mut Transaction,
    ) -> Result<(), DispatchError> {
        let name = string_arg(msg)?;

        let uid = if name == DRIVER_NAME {
            // SAFETY: getuid cannot fail.
            unsafe { libc::getuid() }
        } else {
            let target = match self.names.lookup(name) {
                Some(conn) => conn,
                None => {
                    return Err(DispatchError::Wire {
                        name: err::NAME_HAS_NO_OWNER,
                        detail: format!("Name {name:?} has no owner"),
                    });
                }
            };

            match self.conns.get(&target).map(|conn| conn.peer_uid()) {
                Some(Ok(uid)) => uid,
                _ => {
                    return Err(DispatchError::Wire {
                        name: err::FAILED,
                        detail: format!("Could not determine the uid of {name:?}"),
                    });
                }
            }
        };

        let mut body = BodyBuf::new();
        body.store(uid)?;
        self.stage_reply(txn, sender, msg, body)
    }
}

/// Read the single string argument of a driver call.
fn string_arg(msg: &MessageBuf) -> Result<&str, DispatchError> {
    if msg.signature() != "s" {
        return Err(invalid_args("Expected a single string argument"));
    }

    let reader = msg.body().reader();

    match reader.read_basic() {
        Ok(Basic::Str(value)) => Ok(value),
        Ok(_) => Err(invalid_args("Expected a single string argument")),
        Err(error) => Err(invalid_args(error.to_string())),
    }
}

/// Read the (string, u32) arguments of a driver call.
fn string_u32_args(msg: &MessageBuf) -> Result<(&str, u32), DispatchError> {
    if msg.signature() != "su" {
        return Err(invalid_args("Expected string and u32 arguments"));
    }

    let mut reader = msg.body().reader();

    let name = match reader.read_basic() {
        Ok(Basic::Str(name)) => name,
        Ok(_) => return Err(invalid_args("Expected a string argument")),
        Err(error) => return Err(invalid_args(error.to_string())),
    };

    reader.next().map_err(|e| invalid_args(e.to_string()))?;

    let flags = match reader.read_basic() {
        Ok(Basic::U32(flags)) => flags,
        Ok(_) => return Err(invalid_args("Expected a u32 argument")),
        Err(error) => return Err(invalid_args(error.to_string())),
    };

    Ok((name, flags))
}

/// Require an empty body.
fn no_args(msg: &MessageBuf) -> Result<(), DispatchError> {
    if !msg.signature().is_empty() {
        return Err(invalid_args("Expected no arguments"));
    }

    Ok(())
}
