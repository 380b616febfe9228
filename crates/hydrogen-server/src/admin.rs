//! Administrative commands and operator events.
//!
//! Commands arrive one per line on the FIFO and use shell-like
//! tokenisation with double quotes. Driver lifecycle transitions and
//! rejected commands are published on a broadcast channel.

use std::fmt;

use crate::driver::{DriverSpec, DriverState};
use crate::error::{Result, ServerError};

/// A parsed administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Start a local driver or a remote proxy.
    Start(DriverSpec),
    /// Stop a driver by name, binary or remote target.
    Stop {
        target: String,
        name: Option<String>,
    },
    /// Add a snoop on behalf of a running driver.
    Snoop {
        driver: String,
        device: String,
        property: Option<String>,
    },
    /// Remove a snoop previously added for a driver.
    Unsnoop {
        driver: String,
        device: String,
        property: Option<String>,
    },
}

/// Event published on the operator channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminEvent {
    /// A driver moved to a new lifecycle state.
    DriverState { driver: String, state: DriverState },
    /// A driver gave up: spawn failure, crash loop or connect failure.
    DriverFailed { driver: String, reason: String },
    /// A command line was rejected.
    CommandRejected { line: String, reason: String },
}

impl fmt::Display for AdminEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminEvent::DriverState { driver, state } => write!(f, "{driver}: {state}"),
            AdminEvent::DriverFailed { driver, reason } => write!(f, "{driver} failed: {reason}"),
            AdminEvent::CommandRejected { line, reason } => {
                write!(f, "rejected '{line}': {reason}")
            }
        }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminCommand::Start(spec) => write!(f, "start {}", spec.name()),
            AdminCommand::Stop { target, name } => {
                write!(f, "stop {target}")?;
                if let Some(name) = name {
                    write!(f, " -n \"{name}\"")?;
                }
                Ok(())
            }
            AdminCommand::Snoop {
                driver,
                device,
                property,
            }
            | AdminCommand::Unsnoop {
                driver,
                device,
                property,
            } => {
                let verb = if matches!(self, AdminCommand::Snoop { .. }) {
                    "snoop"
                } else {
                    "unsnoop"
                };
                write!(f, "{verb} {driver} \"{device}\"")?;
                if let Some(property) = property {
                    write!(f, " {property}")?;
                }
                Ok(())
            }
        }
    }
}

impl AdminCommand {
    /// Parses one command line.
    pub fn parse(line: &str) -> Result<Self> {
        let words = tokenize(line).map_err(|reason| ServerError::command(line, reason))?;
        let reject = |reason: &str| ServerError::command(line, reason);

        let (verb, rest) = match words.split_first() {
            Some((verb, rest)) => (verb.as_str(), rest),
            None => return Err(reject("empty command")),
        };

        match verb {
            "start" => {
                let (target, options) = split_options(rest).map_err(|r| reject(&r))?;
                let target = target.ok_or_else(|| reject("start needs a driver"))?;
                if target.contains('@') {
                    if !options.is_empty() {
                        return Err(reject("remote drivers take no options"));
                    }
                    let spec = DriverSpec::parse_remote(&target)
                        .map_err(|e| reject(&e.to_string()))?;
                    return Ok(AdminCommand::Start(spec));
                }
                let mut spec = DriverSpec::local(target);
                for (flag, value) in options {
                    spec = match flag {
                        'n' => spec.with_device_name(value),
                        's' => spec.with_skeleton(value),
                        'c' => spec.with_config(value),
                        other => return Err(reject(&format!("unknown option -{other}"))),
                    };
                }
                Ok(AdminCommand::Start(spec))
            }
            "stop" => {
                let (target, options) = split_options(rest).map_err(|r| reject(&r))?;
                let target = target.ok_or_else(|| reject("stop needs a driver"))?;
                let mut name = None;
                for (flag, value) in options {
                    match flag {
                        'n' => name = Some(value),
                        other => return Err(reject(&format!("unknown option -{other}"))),
                    }
                }
                Ok(AdminCommand::Stop { target, name })
            }
            "snoop" | "unsnoop" => {
                let (driver, device, property) = match rest {
                    [driver, device] => (driver.clone(), device.clone(), None),
                    [driver, device, property] => {
                        (driver.clone(), device.clone(), Some(property.clone()))
                    }
                    _ => return Err(reject("expected <driver> <device> [property]")),
                };
                Ok(if verb == "snoop" {
                    AdminCommand::Snoop {
                        driver,
                        device,
                        property,
                    }
                } else {
                    AdminCommand::Unsnoop {
                        driver,
                        device,
                        property,
                    }
                })
            }
            other => Err(reject(&format!("unknown command '{other}'"))),
        }
    }
}

/// Splits a line into words. Double quotes group; `\"` inside quotes is a quote.
fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if quoted => match chars.next() {
                Some(next) => current.push(next),
                None => return Err("dangling escape".to_string()),
            },
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quoted {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

type Options = Vec<(char, String)>;

/// Separates the positional target from `-x value` options.
fn split_options(words: &[String]) -> std::result::Result<(Option<String>, Options), String> {
    let mut target = None;
    let mut options = Vec::new();
    let mut iter = words.iter();

    while let Some(word) = iter.next() {
        let mut flag = word.chars();
        match (flag.next(), flag.next(), flag.next()) {
            (Some('-'), Some(letter), None) => {
                let value = iter
                    .next()
                    .ok_or_else(|| format!("option -{letter} needs a value"))?;
                options.push((letter, value.clone()));
            }
            _ if target.is_none() => target = Some(word.clone()),
            _ => return Err(format!("unexpected argument '{word}'")),
        }
    }
    Ok((target, options))
}
