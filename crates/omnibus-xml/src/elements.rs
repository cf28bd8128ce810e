/// A parsed `<busconfig>` document.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Config<'a> {
    /// The addresses from `<listen>` elements, in document order.
    pub listen: Box<[&'a str]>,
    /// The directories from `<servicedir>` elements.
    pub servicedirs: Box<[&'a str]>,
    /// The `<policy>` sections, in document order.
    pub policies: Box<[Policy<'a>]>,
    /// The `<limit>` overrides.
    pub limits: Box<[Limit<'a>]>,
}

/// The applicability of a `<policy>` section.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Applied before more specific policies.
    #[default]
    Default,
    /// Applied last, overriding everything else.
    Mandatory,
}

/// One `<policy>` section and its rules.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Policy<'a> {
    /// When the section applies.
    pub context: Context,
    /// The `<allow>` and `<deny>` rules, in document order.
    pub rules: Box<[Rule<'a>]>,
}

/// One `<allow>` or `<deny>` rule.
///
/// Every populated attribute narrows the rule; an attribute-less rule
/// matches everything.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Rule<'a> {
    /// Whether the rule allows or denies.
    pub allow: bool,
    /// Restrict to messages of this type (`method_call`, `method_return`,
    /// `error` or `signal`).
    pub send_type: Option<&'a str>,
    /// Restrict to messages sent to this name.
    pub send_destination: Option<&'a str>,
    /// Restrict to messages sent by the owner of this name.
    pub send_sender: Option<&'a str>,
    /// Restrict to this interface.
    pub send_interface: Option<&'a str>,
    /// Restrict to this member.
    pub send_member: Option<&'a str>,
    /// Restrict to requests to own this name.
    pub own: Option<&'a str>,
}

/// One `<limit name="...">value</limit>` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit<'a> {
    /// The name of the limit.
    pub name: &'a str,
    /// Its value.
    pub value: u64,
}
