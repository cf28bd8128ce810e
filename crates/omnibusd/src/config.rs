//! Mapping of the parsed XML configuration onto broker configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use tracing::{debug, warn};

use omnibus::bus::{BusConfig, Policy, PolicyRule, ServiceFile};
use omnibus::{Address, MessageType};

/// Load and translate the configuration file at `path`.
pub fn load(path: &Path) -> Result<BusConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let parsed = omnibus_xml::parse_config(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;

    let mut config = BusConfig::default();

    for address in parsed.listen.iter() {
        config
            .addresses
            .extend(Address::parse_list(address).context("parsing listen address")?);
    }

    // Default policies apply in order, mandatory ones after them, so the
    // last applicable rule of the most binding section wins.
    let mut rules = Vec::new();

    for policy in parsed
        .policies
        .iter()
        .filter(|p| p.context == omnibus_xml::Context::Default)
        .chain(
            parsed
                .policies
                .iter()
                .filter(|p| p.context == omnibus_xml::Context::Mandatory),
        )
    {
        for rule in policy.rules.iter() {
            rules.push(map_rule(rule)?);
        }
    }

    config.policy = Policy::new(rules);

    for dir in parsed.servicedirs.iter() {
        load_services(Path::new(dir), &mut config.services);
    }

    for limit in parsed.limits.iter() {
        apply_limit(&mut config, limit.name, limit.value)?;
    }

    Ok(config)
}

fn map_rule(rule: &omnibus_xml::Rule<'_>) -> Result<PolicyRule> {
    let msg_type = match rule.send_type {
        None => None,
        Some("method_call") => Some(MessageType::METHOD_CALL),
        Some("method_return") => Some(MessageType::METHOD_RETURN),
        Some("error") => Some(MessageType::ERROR),
        Some("signal") => Some(MessageType::SIGNAL),
        Some(other) => bail!("unknown send_type {other:?} in policy rule"),
    };

    Ok(PolicyRule {
        allow: rule.allow,
        msg_type,
        sender: rule.send_sender.map(Box::from),
        destination: rule.send_destination.map(Box::from),
        interface: rule.send_interface.map(Box::from),
        member: rule.send_member.map(Box::from),
        own: rule.own.map(Box::from),
    })
}

/// Scan one service directory for `.service` files.
fn load_services(dir: &Path, services: &mut Vec<ServiceFile>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            warn!("skipping service directory {}: {error}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.extension().is_none_or(|ext| ext != "service") {
            continue;
        }

        let Ok(contents) = std::fs::read_to_string(&path) else {
            warn!("skipping unreadable service file {}", path.display());
            continue;
        };

        match ServiceFile::parse(&contents) {
            Some(service) => {
                debug!(name = &*service.name, "loaded service file");
                services.push(service);
            }
            None => warn!("malformed service file {}", path.display()),
        }
    }
}

fn apply_limit(config: &mut BusConfig, name: &str, value: u64) -> Result<()> {
    let limits = &mut config.limits;

    match name {
        "max_incoming_bytes" => limits.max_incoming_bytes = value as usize,
        "max_outgoing_bytes" => limits.max_outgoing_bytes = value as usize,
        "max_message_size" => limits.max_message_size = value as usize,
        "max_match_rules_per_connection" => limits.max_match_rules = value as usize,
        "service_start_timeout" => {
            limits.activation_timeout = Duration::from_millis(value);
        }
        "max_memory" => limits.mem_capacity = Some(value as usize),
        other => bail!("unknown limit {other:?}"),
    }

    Ok(())
}
