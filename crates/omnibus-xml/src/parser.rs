use std::fmt::Write;

use xmlparser::{ElementEnd, Token};

use crate::error::ErrorKind;
use crate::{Config, Context, Error, Limit, Policy, Result, Rule};

/// Parse the contents of a bus configuration file.
pub fn parse_config(config: &str) -> Result<Config<'_>> {
    let tokenizer = xmlparser::Tokenizer::from(config);

    let mut stack = vec![];
    let mut path = String::new();
    let mut root = ConfigBuilder::default();

    macro_rules! expect_end {
        ($end:expr, $expected:literal) => {
            if let Some(end) = $end {
                if end != $expected {
                    return Err(Error::new(
                        path,
                        ErrorKind::MismatchingEnd {
                            expected: $expected.into(),
                            actual: end.into(),
                        },
                    ));
                }
            }
        };
    }

    for token in tokenizer {
        let token = match token {
            Ok(token) => token,
            Err(error) => return Err(Error::new(path, error)),
        };

        match token {
            Token::ElementStart { local, .. } => {
                match (stack.last(), local.as_str()) {
                    (None, "busconfig") => {
                        stack.push(State::BusConfig);
                    }
                    (Some(State::BusConfig), "listen") => {
                        stack.push(State::Text("listen", TextBuilder::default()));
                    }
                    (Some(State::BusConfig), "servicedir") => {
                        stack.push(State::Text("servicedir", TextBuilder::default()));
                    }
                    (Some(State::BusConfig), "policy") => {
                        stack.push(State::Policy(PolicyBuilder::default()));
                    }
                    (Some(State::BusConfig), "limit") => {
                        stack.push(State::Limit(LimitBuilder::default()));
                    }
                    (Some(State::Policy(..)), "allow") => {
                        stack.push(State::Rule(Rule {
                            allow: true,
                            ..Rule::default()
                        }));
                    }
                    (Some(State::Policy(..)), "deny") => {
                        stack.push(State::Rule(Rule {
                            allow: false,
                            ..Rule::default()
                        }));
                    }
                    (_, element) => {
                        return Err(Error::new(
                            path,
                            ErrorKind::UnsupportedElementStart(element.into()),
                        ));
                    }
                }

                if !path.is_empty() {
                    path.push('/');
                }

                path.push_str(local.as_str());

                if let [.., State::Policy(policy), State::Rule(..)] = &stack[..] {
                    let _ = write!(path, "[{}]", policy.rules.len());
                }
            }
            Token::ElementEnd { end, .. } => {
                let name = match end {
                    ElementEnd::Open => {
                        continue;
                    }
                    ElementEnd::Close(_, name) => Some(name.as_str()),
                    ElementEnd::Empty => None,
                };

                let Some(top) = stack.pop() else {
                    return Err(Error::new(path, ErrorKind::UnsupportedElementEnd));
                };

                match (&mut stack[..], top) {
                    ([], State::BusConfig) => {
                        expect_end!(name, "busconfig");
                    }
                    ([State::BusConfig], State::Text("listen", text)) => {
                        expect_end!(name, "listen");
                        root.listen.extend(text.text);
                    }
                    ([State::BusConfig], State::Text("servicedir", text)) => {
                        expect_end!(name, "servicedir");
                        root.servicedirs.extend(text.text);
                    }
                    ([State::BusConfig], State::Policy(builder)) => {
                        expect_end!(name, "policy");
                        root.policies.push(builder.build());
                    }
                    ([State::BusConfig], State::Limit(builder)) => {
                        expect_end!(name, "limit");
                        root.limits
                            .push(builder.build().map_err(|kind| Error::new(path.as_str(), kind))?);
                    }
                    ([.., State::Policy(policy)], State::Rule(rule)) => {
                        if rule.allow {
                            expect_end!(name, "allow");
                        } else {
                            expect_end!(name, "deny");
                        }

                        policy.rules.push(rule);
                    }
                    _ => return Err(Error::new(path, ErrorKind::UnsupportedElementEnd)),
                }

                if let Some(index) = path.rfind('/') {
                    path.truncate(index);
                } else {
                    path.clear();
                }
            }
            Token::Attribute { local, value, .. } => {
                let len = path.len();
                path.push(':');
                path.push_str(local.as_str());

                match (&mut stack[..], local.as_str()) {
                    ([.., State::Policy(builder)], "context") => {
                        builder.context = match value.as_str() {
                            "default" => Context::Default,
                            "mandatory" => Context::Mandatory,
                            other => {
                                return Err(Error::new(
                                    path,
                                    ErrorKind::UnsupportedPolicyContext(other.into()),
                                ));
                            }
                        };
                    }
                    ([.., State::Rule(rule)], "send_type") => {
                        rule.send_type = Some(value.as_str());
                    }
                    ([.., State::Rule(rule)], "send_destination") => {
                        rule.send_destination = Some(value.as_str());
                    }
                    ([.., State::Rule(rule)], "send_sender") => {
                        rule.send_sender = Some(value.as_str());
                    }
                    ([.., State::Rule(rule)], "send_interface") => {
                        rule.send_interface = Some(value.as_str());
                    }
                    ([.., State::Rule(rule)], "send_member") => {
                        rule.send_member = Some(value.as_str());
                    }
                    ([.., State::Rule(rule)], "own") => {
                        rule.own = Some(value.as_str());
                    }
                    ([.., State::Limit(builder)], "name") => {
                        builder.name = Some(value.as_str());
                    }
                    (_, name) => {
                        return Err(Error::new(
                            path,
                            ErrorKind::UnsupportedAttribute(name.into()),
                        ));
                    }
                }

                path.truncate(len);
            }
            Token::Text { text } => match stack.last_mut() {
                Some(State::Text(_, builder)) => {
                    builder.text = Some(text.as_str().trim());
                }
                Some(State::Limit(builder)) => {
                    builder.value = Some(text.as_str().trim());
                }
                _ => {
                    if !text.as_str().trim().is_empty() {
                        return Err(Error::new(path, ErrorKind::UnsupportedText));
                    }
                }
            },
            _ => {}
        }
    }

    Ok(root.build())
}

#[derive(Debug, Default)]
struct ConfigBuilder<'a> {
    listen: Vec<&'a str>,
    servicedirs: Vec<&'a str>,
    policies: Vec<Policy<'a>>,
    limits: Vec<Limit<'a>>,
}

impl<'a> ConfigBuilder<'a> {
    fn build(self) -> Config<'a> {
        Config {
            listen: self.listen.into(),
            servicedirs: self.servicedirs.into(),
            policies: self.policies.into(),
            limits: self.limits.into(),
        }
    }
}

#[derive(Debug, Default)]
struct PolicyBuilder<'a> {
    context: Context,
    rules: Vec<Rule<'a>>,
}

impl<'a> PolicyBuilder<'a> {
    fn build(self) -> Policy<'a> {
        Policy {
            context: self.context,
            rules: self.rules.into(),
        }
    }
}

#[derive(Debug, Default)]
struct LimitBuilder<'a> {
    name: Option<&'a str>,
    value: Option<&'a str>,
}

impl<'a> LimitBuilder<'a> {
    fn build(self) -> Result<Limit<'a>, ErrorKind> {
        let name = self.name.ok_or(ErrorKind::MissingLimitName)?;
        let value = self.value.unwrap_or("");

        let value = value
            .parse::<u64>()
            .map_err(|_| ErrorKind::InvalidLimitValue(value.into()))?;

        Ok(Limit { name, value })
    }
}

#[derive(Debug, Default)]
struct TextBuilder<'a> {
    text: Option<&'a str>,
}

#[derive(Debug)]
enum State<'a> {
    BusConfig,
    Text(&'static str, TextBuilder<'a>),
    Policy(PolicyBuilder<'a>),
    Limit(LimitBuilder<'a>),
    Rule(Rule<'a>),
}
