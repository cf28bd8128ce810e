use std::collections::{BTreeSet, VecDeque};
use std::io::{Read as _, Write as _};
use std::mem::size_of;
use std::num::NonZeroU32;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use tracing::trace;

use crate::error::{Error, ErrorKind, Result};
use crate::mainloop::WatchId;
use crate::sasl::SaslServer;
use crate::{MessageBuf, RecvBuf, SendBuf};

use super::{ConnId, Limits};

/// The authentication phase of a connection's byte stream.
enum Phase {
    /// Running the line-oriented auth exchange. The leading NUL byte of the
    /// stream is consumed before the first line.
    Auth {
        sasl: SaslServer,
        line: Vec<u8>,
        saw_nul: bool,
    },
    /// Authenticated; the stream carries messages.
    Messages,
}

/// Whether one pump of the transport produced bytes, blocked, or hit end of
/// stream.
enum Progress {
    Bytes,
    Blocked,
    Eof,
}

/// What reading from a connection produced.
pub(crate) enum Input {
    /// Nothing further to do.
    Idle,
    /// Complete messages were queued and the connection needs dispatch.
    NeedsDispatch,
    /// The peer disconnected or was malformed and must be dropped.
    Disconnect,
}

/// Per-peer connection state: the transport, its inbound and outbound
/// buffers and queues, the identity assigned by the bus, and the reply
/// reserved for reporting memory pressure.
pub(crate) struct Conn {
    pub(crate) id: ConnId,
    pub(crate) stream: UnixStream,
    pub(crate) watch: WatchId,
    phase: Phase,
    /// Framing buffer for inbound bytes.
    pub(crate) recv: RecvBuf,
    /// Marshalling buffer for outbound bytes.
    pub(crate) send: SendBuf,
    /// Fully parsed messages waiting for dispatch.
    pub(crate) inbound: VecDeque<MessageBuf>,
    /// Committed messages waiting to be marshalled and written.
    pub(crate) outgoing: VecDeque<Rc<MessageBuf>>,
    /// Bytes currently charged against this connection's outgoing quota.
    pub(crate) out_reserved: usize,
    /// Set once Hello has completed.
    pub(crate) registered: bool,
    /// The bus-assigned unique name, set at Hello.
    pub(crate) unique: Option<Box<str>>,
    /// Well-known names this connection currently owns.
    pub(crate) names: BTreeSet<Box<str>>,
    /// The error reply reserved at accept time so that reporting memory
    /// pressure never requires further allocation.
    pub(crate) oom_reply: Option<MessageBuf>,
}

impl Conn {
    pub(crate) fn new(
        id: ConnId,
        stream: UnixStream,
        watch: WatchId,
        guid: Box<str>,
        oom_reply: MessageBuf,
    ) -> Result<Self> {
        stream.set_nonblocking(true)?;

        Ok(Self {
            id,
            stream,
            watch,
            phase: Phase::Auth {
                sasl: SaslServer::new(guid),
                line: Vec::new(),
                saw_nul: false,
            },
            recv: RecvBuf::new(),
            send: SendBuf::new(),
            inbound: VecDeque::new(),
            outgoing: VecDeque::new(),
            out_reserved: 0,
            registered: false,
            unique: None,
            names: BTreeSet::new(),
            oom_reply: Some(oom_reply),
        })
    }

    /// The unique name, which is present on every registered connection.
    pub(crate) fn unique_name(&self) -> Option<&str> {
        self.unique.as_deref()
    }

    /// Whether the connection has bytes waiting to be written.
    pub(crate) fn wants_write(&self) -> bool {
        !self.send.is_empty() || !self.outgoing.is_empty()
    }

    /// Whether further reads should be deferred until dispatch catches up.
    pub(crate) fn input_throttled(&self, limits: &Limits) -> bool {
        self.recv.len() > limits.max_incoming_bytes || self.inbound.len() > 64
    }

    /// Read from the transport and frame as many messages as possible.
    pub(crate) fn handle_input(&mut self, limits: &Limits) -> Result<Input> {
        loop {
            if self.input_throttled(limits) {
                break;
            }

            let progress = if matches!(self.phase, Phase::Messages) {
                match self.recv.read_from(&mut self.stream) {
                    Ok(0) => return Ok(Input::Disconnect),
                    Ok(_) => Progress::Bytes,
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        Progress::Blocked
                    }
                    Err(error) => return Err(error.into()),
                }
            } else {
                match self.read_auth()? {
                    Progress::Eof => return Ok(Input::Disconnect),
                    progress => progress,
                }
            };

            if matches!(self.phase, Phase::Messages) {
                while let Some(message) = self.recv.try_parse()? {
                    if message.size_hint() > limits.max_message_size {
                        return Err(Error::new(ErrorKind::BodyTooLong(
                            message.body().len() as u32,
                        )));
                    }

                    trace!(
                        conn = self.id.0,
                        serial = message.serial().get(),
                        "queued inbound message"
                    );

                    self.inbound.push_back(message);
                }
            }

            if matches!(progress, Progress::Blocked) {
                break;
            }
        }

        if self.inbound.is_empty() {
            Ok(Input::Idle)
        } else {
            Ok(Input::NeedsDispatch)
        }
    }

    /// Read and process authentication lines.
    ///
    /// Transitions to the message phase when the exchange completes,
    /// transplanting any pipelined bytes into the message framing buffer.
    fn read_auth(&mut self) -> Result<Progress> {
        let Phase::Auth { sasl, line, saw_nul } = &mut self.phase else {
            return Ok(Progress::Bytes);
        };

        let mut chunk = [0u8; 256];

        let n = match self.stream.read(&mut chunk) {
            Ok(0) => return Ok(Progress::Eof),
            Ok(n) => n,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok(Progress::Blocked);
            }
            Err(error) => return Err(error.into()),
        };

        line.extend_from_slice(&chunk[..n]);

        if !*saw_nul {
            match line.first() {
                Some(0) => {
                    line.remove(0);
                    *saw_nul = true;
                }
                Some(_) => return Err(Error::new(ErrorKind::InvalidSasl)),
                None => return Ok(Progress::Bytes),
            }
        }

        while let Some(end) = line.windows(2).position(|w| w == b"\r\n") {
            let command: Vec<u8> = line.drain(..end + 2).take(end).collect();

            if let Some(reply) = sasl.advance(&command)? {
                self.send.write_raw(reply.as_bytes());
                self.send.write_raw(b"\r\n");
            }

            if sasl.is_done() {
                // Bytes pipelined after BEGIN are already message data.
                self.recv.feed(line);
                self.phase = Phase::Messages;
                break;
            }
        }

        Ok(Progress::Bytes)
    }

    /// Write as much pending outbound data as the transport accepts,
    /// marshalling queued messages as the buffer drains.
    ///
    /// Returns `false` when the peer hung up.
    pub(crate) fn flush(&mut self) -> Result<bool> {
        loop {
            if self.send.is_empty() {
                let Some(message) = self.outgoing.pop_front() else {
                    break;
                };

                let bytes = message.size_hint();
                self.out_reserved = self.out_reserved.saturating_sub(bytes);
                self.send.write_message(&message.borrow())?;
            }

            match self.stream.write(self.send.get()) {
                Ok(0) => return Ok(false),
                Ok(n) => self.send.advance(n),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => {
                    return Ok(false);
                }
                Err(error) => return Err(error.into()),
            }
        }

        Ok(true)
    }

    /// Bytes released back to the memory pool when the connection goes
    /// away.
    pub(crate) fn reserved_bytes(&self) -> usize {
        self.out_reserved
    }

    /// Take the reserved out-of-memory reply, filling in the serial of the
    /// message that could not be routed.
    pub(crate) fn take_oom_reply(&mut self, reply_serial: NonZeroU32) -> Option<MessageBuf> {
        let mut reply = self.oom_reply.take()?;

        if let crate::message::OwnedMessageKind::Error {
            reply_serial: serial,
            ..
        } = &mut reply.kind
        {
            *serial = reply_serial;
        }

        if let Some(unique) = self.unique.as_deref() {
            reply.destination = Some(Box::from(unique));
        }

        Some(reply)
    }

    /// The peer's uid from its socket credentials.
    #[cfg(target_os = "linux")]
    pub(crate) fn peer_uid(&self) -> Result<u32> {
        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };

        let mut len = size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: cred is a properly sized out-parameter for SO_PEERCRED.
        let rc = unsafe {
            libc::getsockopt(
                self.stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&raw mut cred).cast(),
                &mut len,
            )
        };

        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(cred.uid)
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn peer_uid(&self) -> Result<u32> {
        Err(Error::new(ErrorKind::InvalidProtocol))
    }
}
