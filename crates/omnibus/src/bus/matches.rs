use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, ErrorKind, Result};
use crate::proto::{MessageType, Type};
use crate::{MessageBuf, MessageKind};

use super::ConnId;

/// A parsed match rule: a conjunction of optional predicates over message
/// attributes.
///
/// # Examples
///
/// ```
/// use omnibus::bus::MatchRule;
///
/// let rule = MatchRule::parse("type='signal',interface='com.example.Light',arg0='on'")?;
/// assert_eq!(rule.text(), "type='signal',interface='com.example.Light',arg0='on'");
/// # Ok::<_, omnibus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    text: Box<str>,
    msg_type: Option<MessageType>,
    sender: Option<Box<str>>,
    interface: Option<Box<str>>,
    member: Option<Box<str>>,
    path: Option<Box<str>>,
    destination: Option<Box<str>>,
    /// String arguments by index, checked against the body.
    args: Vec<(usize, Box<str>)>,
}

impl MatchRule {
    /// Parse a rule of the form `key='value',…`.
    ///
    /// An empty rule matches every message.
    pub fn parse(text: &str) -> Result<MatchRule> {
        let mut rule = MatchRule {
            text: Box::from(text),
            msg_type: None,
            sender: None,
            interface: None,
            member: None,
            path: None,
            destination: None,
            args: Vec::new(),
        };

        let mut rest = text.trim();

        while !rest.is_empty() {
            let Some((key, tail)) = rest.split_once('=') else {
                return Err(Error::new(ErrorKind::InvalidMatchRule));
            };

            let Some(tail) = tail.strip_prefix('\'') else {
                return Err(Error::new(ErrorKind::InvalidMatchRule));
            };

            let Some((value, tail)) = tail.split_once('\'') else {
                return Err(Error::new(ErrorKind::InvalidMatchRule));
            };

            rest = match tail.strip_prefix(',') {
                Some(tail) => tail.trim_start(),
                None if tail.is_empty() => "",
                None => return Err(Error::new(ErrorKind::InvalidMatchRule)),
            };

            match key.trim() {
                "type" => {
                    rule.msg_type = Some(match value {
                        "method_call" => MessageType::METHOD_CALL,
                        "method_return" => MessageType::METHOD_RETURN,
                        "error" => MessageType::ERROR,
                        "signal" => MessageType::SIGNAL,
                        _ => return Err(Error::new(ErrorKind::InvalidMatchRule)),
                    });
                }
                "sender" => rule.sender = Some(Box::from(value)),
                "interface" => rule.interface = Some(Box::from(value)),
                "member" => rule.member = Some(Box::from(value)),
                "path" => rule.path = Some(Box::from(value)),
                "destination" => rule.destination = Some(Box::from(value)),
                key => {
                    let Some(index) = key.strip_prefix("arg") else {
                        return Err(Error::new(ErrorKind::InvalidMatchRule));
                    };

                    let Ok(index) = index.parse::<usize>() else {
                        return Err(Error::new(ErrorKind::InvalidMatchRule));
                    };

                    if index > 63 {
                        return Err(Error::new(ErrorKind::InvalidMatchRule));
                    }

                    rule.args.push((index, Box::from(value)));
                }
            }
        }

        Ok(rule)
    }

    /// The textual form the rule was parsed from, used to remove it again.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the rule matches `message`.
    pub fn matches(&self, message: &MessageBuf) -> bool {
        if let Some(msg_type) = self.msg_type {
            if message.message_type() != msg_type {
                return false;
            }
        }

        if let Some(want) = self.sender.as_deref() {
            if message.sender() != Some(want) {
                return false;
            }
        }

        if let Some(want) = self.interface.as_deref() {
            if message.interface() != Some(want) {
                return false;
            }
        }

        if let Some(want) = self.destination.as_deref() {
            if message.destination() != Some(want) {
                return false;
            }
        }

        let (path, member) = match message.kind() {
            MessageKind::MethodCall { path, member } => (Some(path), Some(member)),
            MessageKind::Signal { path, member } => (Some(path), Some(member)),
            _ => (None, None),
        };

        if let Some(want) = self.member.as_deref() {
            if member != Some(want) {
                return false;
            }
        }

        if let Some(want) = self.path.as_deref() {
            if path.map(|p| p.as_str()) != Some(want) {
                return false;
            }
        }

        if !self.args.is_empty() && !self.match_args(message) {
            return false;
        }

        true
    }

    /// Check the indexed string-argument predicates against the body.
    fn match_args(&self, message: &MessageBuf) -> bool {
        let body = message.body();
        let mut reader = body.reader();

        let mut wanted = self.args.clone();
        wanted.sort_by_key(|(index, _)| *index);

        let mut index = 0;

        for (want_index, want) in wanted {
            // Walk forward to the wanted argument.
            while index < want_index {
                match reader.next() {
                    Ok(true) => index += 1,
                    _ => return false,
                }
            }

            if reader.current_type() != Type::STRING {
                return false;
            }

            match reader.read_basic() {
                Ok(value) => {
                    if value.as_str() != Some(&*want) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }

        true
    }
}

/// The store of subscriptions, indexed by the most selective common
/// predicates: message type and interface. The remaining predicates are
/// checked linearly over the narrowed bucket.
pub(crate) struct MatchStore {
    /// Buckets keyed by message type byte, with 0 collecting rules without
    /// a type predicate.
    buckets: HashMap<u8, Bucket>,
    /// All rules per connection, for removal and disconnect.
    by_conn: HashMap<ConnId, Vec<Rc<MatchRule>>>,
}

#[derive(Default)]
struct Bucket {
    by_interface: HashMap<Box<str>, Vec<(ConnId, Rc<MatchRule>)>>,
    any_interface: Vec<(ConnId, Rc<MatchRule>)>,
}

impl Bucket {
    fn insert(&mut self, conn: ConnId, rule: Rc<MatchRule>) {
        match rule.interface.as_deref() {
            Some(interface) => self
                .by_interface
                .entry(Box::from(interface))
                .or_default()
                .push((conn, rule)),
            None => self.any_interface.push((conn, rule)),
        }
    }

    fn remove(&mut self, conn: ConnId, rule: &MatchRule) {
        let same = |(c, r): &(ConnId, Rc<MatchRule>)| *c == conn && **r == *rule;

        match rule.interface.as_deref() {
            Some(interface) => {
                if let Some(rules) = self.by_interface.get_mut(interface) {
                    if let Some(at) = rules.iter().position(same) {
                        rules.remove(at);
                    }
                }
            }
            None => {
                if let Some(at) = self.any_interface.iter().position(same) {
                    self.any_interface.remove(at);
                }
            }
        }
    }
}

impl MatchStore {
    pub(crate) fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            by_conn: HashMap::new(),
        }
    }

    /// The number of rules owned by `conn`.
    pub(crate) fn count(&self, conn: ConnId) -> usize {
        self.by_conn.get(&conn).map_or(0, Vec::len)
    }

    /// Whether `conn` owns a rule with the given text.
    pub(crate) fn has(&self, conn: ConnId, text: &str) -> bool {
        self.by_conn
            .get(&conn)
            .is_some_and(|rules| rules.iter().any(|rule| rule.text() == text))
    }

    /// Add a rule owned by `conn`.
    pub(crate) fn add(&mut self, conn: ConnId, rule: MatchRule) {
        let rule = Rc::new(rule);
        let type_key = rule.msg_type.map_or(0, MessageType::get);

        self.buckets
            .entry(type_key)
            .or_default()
            .insert(conn, rule.clone());

        self.by_conn.entry(conn).or_default().push(rule);
    }

    /// Remove the first rule of `conn` whose text is `text`.
    ///
    /// Returns whether a rule was removed.
    pub(crate) fn remove(&mut self, conn: ConnId, text: &str) -> bool {
        let Some(rules) = self.by_conn.get_mut(&conn) else {
            return false;
        };

        let Some(at) = rules.iter().position(|rule| rule.text() == text) else {
            return false;
        };

        let rule = rules.remove(at);
        let type_key = rule.msg_type.map_or(0, MessageType::get);

        if let Some(bucket) = self.buckets.get_mut(&type_key) {
            bucket.remove(conn, &rule);
        }

        true
    }

    /// Drop every rule owned by `conn`.
    pub(crate) fn remove_conn(&mut self, conn: ConnId) {
        let Some(rules) = self.by_conn.remove(&conn) else {
            return;
        };

        for rule in rules {
            let type_key = rule.msg_type.map_or(0, MessageType::get);

            if let Some(bucket) = self.buckets.get_mut(&type_key) {
                bucket.remove(conn, &rule);
            }
        }
    }

    /// Compute the set of connections whose rules match `message`,
    /// excluding the sender and the addressed recipient. Each connection
    /// appears at most once regardless of how many of its rules match.
    pub(crate) fn recipients(
        &self,
        message: &MessageBuf,
        exclude_sender: Option<ConnId>,
        exclude_addressed: Option<ConnId>,
    ) -> Vec<ConnId> {
        let mut recipients = Vec::new();
        let interface = message.interface();

        for type_key in [message.message_type().get(), 0] {
            let Some(bucket) = self.buckets.get(&type_key) else {
                continue;
            };

            let rows = bucket.any_interface.iter();

            let narrowed = interface
                .and_then(|interface| bucket.by_interface.get(interface))
                .into_iter()
                .flatten();

            for (conn, rule) in rows.chain(narrowed) {
                if Some(*conn) == exclude_sender || Some(*conn) == exclude_addressed {
                    continue;
                }

                if recipients.contains(conn) {
                    continue;
                }

                if rule.matches(message) {
                    recipients.push(*conn);
                }
            }
        }

        recipients
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crate::{MessageBuf, ObjectPath};

    use super::super::ConnId;
    use super::{MatchRule, MatchStore};

    fn signal(interface: &str, member: &str) -> MessageBuf {
        MessageBuf::signal(
            ObjectPath::new_const(b"/com/example").into(),
            member.into(),
            NonZeroU32::new(1).unwrap(),
        )
        .with_interface(interface.into())
        .with_sender(":1.5".into())
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(MatchRule::parse("type=signal").is_err());
        assert!(MatchRule::parse("type='nonsense'").is_err());
        assert!(MatchRule::parse("frob='x'").is_err());
        assert!(MatchRule::parse("arg99='x'").is_err());
        assert!(MatchRule::parse("type='signal'garbage").is_err());
    }

    #[test]
    fn wildcard_matches_everything() {
        let rule = MatchRule::parse("").unwrap();
        assert!(rule.matches(&signal("com.example.Iface", "Member")));
    }

    #[test]
    fn predicates_are_conjunctive() {
        let rule = MatchRule::parse("type='signal',interface='com.example.Iface'").unwrap();
        assert!(rule.matches(&signal("com.example.Iface", "Member")));
        assert!(!rule.matches(&signal("com.example.Other", "Member")));

        let rule = MatchRule::parse("sender=':1.9'").unwrap();
        assert!(!rule.matches(&signal("com.example.Iface", "Member")));
    }

    #[test]
    fn arg_predicates_check_the_body() {
        let mut body = crate::BodyBuf::new();
        body.store("on").unwrap();
        body.store(7u32).unwrap();
        body.store("bright").unwrap();

        let message = signal("com.example.Light", "Changed").with_body(body);

        let rule = MatchRule::parse("arg0='on',arg2='bright'").unwrap();
        assert!(rule.matches(&message));

        let rule = MatchRule::parse("arg0='off'").unwrap();
        assert!(!rule.matches(&message));

        // Argument 1 is not a string.
        let rule = MatchRule::parse("arg1='7'").unwrap();
        assert!(!rule.matches(&message));
    }

    #[test]
    fn store_narrows_and_dedupes() {
        let mut store = MatchStore::new();
        let (a, b, sender) = (ConnId(1), ConnId(2), ConnId(3));

        store.add(a, MatchRule::parse("type='signal'").unwrap());
        store.add(a, MatchRule::parse("interface='com.example.Iface'").unwrap());
        store.add(b, MatchRule::parse("member='Member'").unwrap());

        let message = signal("com.example.Iface", "Member");

        let recipients = store.recipients(&message, Some(sender), None);
        assert_eq!(recipients.len(), 2);
        assert!(recipients.contains(&a));
        assert!(recipients.contains(&b));

        // The subscriber is excluded when it is the sender.
        let recipients = store.recipients(&message, Some(a), None);
        assert_eq!(recipients, vec![b]);
    }

    #[test]
    fn remove_by_text() {
        let mut store = MatchStore::new();
        let a = ConnId(1);

        store.add(a, MatchRule::parse("type='signal'").unwrap());
        assert!(store.remove(a, "type='signal'"));
        assert!(!store.remove(a, "type='signal'"));

        let message = signal("com.example.Iface", "Member");
        assert!(store.recipients(&message, None, None).is_empty());
    }
}
