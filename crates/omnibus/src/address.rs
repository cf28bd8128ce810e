use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind, Result};

/// A parsed listen or connect address.
///
/// Address strings take the form `<transport>:<key>=<value>[,…]`, and
/// several addresses can be joined with `;` to be attempted in order.
///
/// # Examples
///
/// ```
/// use omnibus::Address;
///
/// let addresses = Address::parse_list("unix:path=/tmp/bus-a;unix:path=/tmp/bus-b")?;
/// assert_eq!(addresses.len(), 2);
/// assert_eq!(addresses[0].to_string(), "unix:path=/tmp/bus-a");
/// # Ok::<_, omnibus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A unix domain socket bound to a filesystem path.
    Unix {
        /// The path of the socket.
        path: PathBuf,
    },
}

impl Address {
    /// Parse a `;`-separated list of addresses.
    pub fn parse_list(string: &str) -> Result<Vec<Address>> {
        let mut addresses = Vec::new();

        for part in string.split(';') {
            if part.is_empty() {
                continue;
            }

            addresses.push(Self::parse(part)?);
        }

        if addresses.is_empty() {
            return Err(Error::new(ErrorKind::InvalidAddress));
        }

        Ok(addresses)
    }

    /// Parse a single address.
    pub fn parse(string: &str) -> Result<Address> {
        let Some((transport, rest)) = string.split_once(':') else {
            return Err(Error::new(ErrorKind::InvalidAddress));
        };

        if transport != "unix" {
            return Err(Error::new(ErrorKind::InvalidAddress));
        }

        let mut path = None;

        for pair in rest.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::new(ErrorKind::InvalidAddress));
            };

            match key {
                "path" => path = Some(PathBuf::from(value)),
                // Listenable guid suffixes and the like are tolerated.
                "guid" => {}
                _ => return Err(Error::new(ErrorKind::InvalidAddress)),
            }
        }

        match path {
            Some(path) => Ok(Address::Unix { path }),
            None => Err(Error::new(ErrorKind::InvalidAddress)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix { path } => {
                write!(f, "unix:path={}", path.display())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Address;

    #[test]
    fn parse_single() {
        let address = Address::parse("unix:path=/run/bus").unwrap();
        assert_eq!(
            address,
            Address::Unix {
                path: "/run/bus".into()
            }
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Address::parse("unix").is_err());
        assert!(Address::parse("tcp:host=x").is_err());
        assert!(Address::parse("unix:nonsense").is_err());
        assert!(Address::parse("unix:frob=1").is_err());
        assert!(Address::parse_list("").is_err());
    }

    #[test]
    fn parse_list_in_order() {
        let addresses = Address::parse_list("unix:path=/a;unix:path=/b").unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[1].to_string(), "unix:path=/b");
    }
}
