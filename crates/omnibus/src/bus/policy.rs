use crate::proto::MessageType;
use crate::{MessageBuf, MessageKind};

/// One allow or deny rule of the security policy.
///
/// Every populated predicate must match for the rule to apply; the last
/// applicable rule wins.
#[derive(Debug, Default, Clone)]
pub struct PolicyRule {
    /// Whether the rule allows or denies.
    pub allow: bool,
    /// Constrain to a message type.
    pub msg_type: Option<MessageType>,
    /// Constrain to messages sent by the connection owning this name.
    pub sender: Option<Box<str>>,
    /// Constrain to messages addressed to this name.
    pub destination: Option<Box<str>>,
    /// Constrain to this interface.
    pub interface: Option<Box<str>>,
    /// Constrain to this member.
    pub member: Option<Box<str>>,
    /// Constrain to ownership requests for this name.
    pub own: Option<Box<str>>,
}

/// The ordered rule set consulted for every delivery and name request.
#[derive(Debug, Default, Clone)]
pub struct Policy {
    rules: Vec<PolicyRule>,
}

impl Policy {
    /// A policy which allows everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Construct a policy from ordered rules.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Whether `message` may travel from `sender` to `destination`.
    ///
    /// Names are the unique names of the connections involved, or `None`
    /// for the bus driver itself.
    pub fn check_send(
        &self,
        sender: Option<&str>,
        destination: Option<&str>,
        message: &MessageBuf,
    ) -> bool {
        let mut allow = true;

        for rule in &self.rules {
            if rule.own.is_some() {
                continue;
            }

            if let Some(msg_type) = rule.msg_type {
                if message.message_type() != msg_type {
                    continue;
                }
            }

            if let Some(want) = rule.sender.as_deref() {
                if sender != Some(want) {
                    continue;
                }
            }

            if let Some(want) = rule.destination.as_deref() {
                if destination != Some(want) {
                    continue;
                }
            }

            if let Some(want) = rule.interface.as_deref() {
                if message.interface() != Some(want) {
                    continue;
                }
            }

            if let Some(want) = rule.member.as_deref() {
                let member = match message.kind() {
                    MessageKind::MethodCall { member, .. } => Some(member),
                    MessageKind::Signal { member, .. } => Some(member),
                    _ => None,
                };

                if member != Some(want) {
                    continue;
                }
            }

            allow = rule.allow;
        }

        allow
    }

    /// Whether a connection may become the owner of `name`.
    pub fn check_own(&self, name: &str) -> bool {
        let mut allow = true;

        for rule in &self.rules {
            match rule.own.as_deref() {
                Some(want) if want == name => allow = rule.allow,
                _ => continue,
            }
        }

        allow
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crate::{MessageBuf, ObjectPath};

    use super::{Policy, PolicyRule};

    fn signal(interface: &str, member: &str) -> MessageBuf {
        MessageBuf::signal(
            ObjectPath::new_const(b"/").into(),
            member.into(),
            NonZeroU32::new(1).unwrap(),
        )
        .with_interface(interface.into())
    }

    #[test]
    fn last_matching_rule_wins() {
        let policy = Policy::new(vec![
            PolicyRule {
                allow: false,
                interface: Some("com.example.Secret".into()),
                ..PolicyRule::default()
            },
            PolicyRule {
                allow: true,
                interface: Some("com.example.Secret".into()),
                member: Some("Ping".into()),
                ..PolicyRule::default()
            },
        ]);

        let denied = signal("com.example.Secret", "Leak");
        assert!(!policy.check_send(Some(":1.0"), None, &denied));

        let allowed = signal("com.example.Secret", "Ping");
        assert!(policy.check_send(Some(":1.0"), None, &allowed));

        let unrelated = signal("com.example.Public", "Leak");
        assert!(policy.check_send(Some(":1.0"), None, &unrelated));
    }

    #[test]
    fn ownership_rules() {
        let policy = Policy::new(vec![PolicyRule {
            allow: false,
            own: Some("com.example.Reserved".into()),
            ..PolicyRule::default()
        }]);

        assert!(!policy.check_own("com.example.Reserved"));
        assert!(policy.check_own("com.example.Other"));
    }
}
