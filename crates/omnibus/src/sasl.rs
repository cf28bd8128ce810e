//! The accepting half of the line-oriented authentication exchange which
//! runs on every connection before messages may flow.
//!
//! Only the EXTERNAL mechanism is supported: the peer's identity comes from
//! its socket credentials, so the initial response is accepted without
//! verification against it.

use crate::error::{Error, ErrorKind, Result};

/// The state of an authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    /// Waiting for an `AUTH` command.
    Auth,
    /// Authentication succeeded, waiting for `BEGIN`.
    WaitingForBegin,
    /// The exchange finished; the byte stream now carries messages.
    Done,
}

/// The server side of one connection's authentication exchange.
///
/// Lines are fed in without their CRLF terminator; replies come back the
/// same way.
///
/// # Examples
///
/// ```
/// use omnibus::SaslServer;
///
/// let mut sasl = SaslServer::new("d5016c331a7a2fa1bb728fd2efd45708".into());
///
/// let reply = sasl.advance(b"AUTH EXTERNAL 31303030")?.unwrap();
/// assert!(reply.starts_with("OK "));
///
/// assert!(sasl.advance(b"BEGIN")?.is_none());
/// assert!(sasl.is_done());
/// # Ok::<_, omnibus::Error>(())
/// ```
pub struct SaslServer {
    state: SaslState,
    guid: Box<str>,
}

impl SaslServer {
    /// Construct a new exchange advertising the given server GUID.
    pub fn new(guid: Box<str>) -> Self {
        Self {
            state: SaslState::Auth,
            guid,
        }
    }

    /// The current state of the exchange.
    pub fn state(&self) -> SaslState {
        self.state
    }

    /// Test if the exchange has finished.
    pub fn is_done(&self) -> bool {
        self.state == SaslState::Done
    }

    /// Process one command line, producing the reply line to send, if any.
    ///
    /// Unknown commands are answered with `ERROR` rather than terminating
    /// the exchange; feeding lines after completion is a caller bug and
    /// errors.
    pub fn advance(&mut self, line: &[u8]) -> Result<Option<String>> {
        match self.state {
            SaslState::Auth => {
                let Some(rest) = line.strip_prefix(b"AUTH") else {
                    return Ok(Some(String::from("ERROR")));
                };

                let mut words = rest.split(|b| *b == b' ').filter(|w| !w.is_empty());

                match words.next() {
                    Some(b"EXTERNAL") => {
                        self.state = SaslState::WaitingForBegin;
                        Ok(Some(format!("OK {}", self.guid)))
                    }
                    _ => Ok(Some(String::from("REJECTED EXTERNAL"))),
                }
            }
            SaslState::WaitingForBegin => match line {
                b"BEGIN" => {
                    self.state = SaslState::Done;
                    Ok(None)
                }
                b"CANCEL" => {
                    self.state = SaslState::Auth;
                    Ok(Some(String::from("REJECTED EXTERNAL")))
                }
                _ => Ok(Some(String::from("ERROR"))),
            },
            SaslState::Done => Err(Error::new(ErrorKind::InvalidSasl)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SaslServer, SaslState};

    fn server() -> SaslServer {
        SaslServer::new("aabbccdd".into())
    }

    #[test]
    fn external_handshake() {
        let mut sasl = server();

        let reply = sasl.advance(b"AUTH EXTERNAL 31303030").unwrap().unwrap();
        assert_eq!(reply, "OK aabbccdd");
        assert_eq!(sasl.state(), SaslState::WaitingForBegin);

        assert!(sasl.advance(b"BEGIN").unwrap().is_none());
        assert!(sasl.is_done());
    }

    #[test]
    fn external_without_initial_response() {
        let mut sasl = server();

        let reply = sasl.advance(b"AUTH EXTERNAL").unwrap().unwrap();
        assert!(reply.starts_with("OK "));
    }

    #[test]
    fn unknown_mechanism_is_rejected() {
        let mut sasl = server();

        let reply = sasl.advance(b"AUTH DBUS_COOKIE_SHA1").unwrap().unwrap();
        assert_eq!(reply, "REJECTED EXTERNAL");
        assert_eq!(sasl.state(), SaslState::Auth);
    }

    #[test]
    fn fd_negotiation_is_refused() {
        let mut sasl = server();

        sasl.advance(b"AUTH EXTERNAL").unwrap();
        let reply = sasl.advance(b"NEGOTIATE_UNIX_FD").unwrap().unwrap();
        assert_eq!(reply, "ERROR");
        assert_eq!(sasl.state(), SaslState::WaitingForBegin);
    }

    #[test]
    fn cancel_restarts_the_exchange() {
        let mut sasl = server();

        sasl.advance(b"AUTH EXTERNAL").unwrap();
        let reply = sasl.advance(b"CANCEL").unwrap().unwrap();
        assert_eq!(reply, "REJECTED EXTERNAL");
        assert_eq!(sasl.state(), SaslState::Auth);
    }
}
