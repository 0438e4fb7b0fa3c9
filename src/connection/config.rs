//! The connection option table and its plumbing: conninfo assembly, value
//! validation, and the version/isolation probes' parsing.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::Error;
use crate::types::IsolationLevel;

/// Saved-value slots for connection-string options.
pub(crate) const CONNINFO_SLOTS: usize = 13;

/// How an option is stored and applied.
#[derive(Debug)]
pub(crate) enum OptKind {
    /// Connection-string option: saved-value slot plus the key name the
    /// client library expects.
    Conninfo { slot: usize, key: &'static str },
    /// Conninfo option validated as a port number.
    Port { slot: usize, key: &'static str },
    Encoding,
    Isolation,
    ReadOnly,
    Attach,
}

#[derive(Debug)]
pub(crate) struct OptionDef {
    pub(crate) name: &'static str,
    pub(crate) kind: OptKind,
    /// Changeable after the connection is open.
    pub(crate) modifiable: bool,
    /// Alias rows share a slot and are skipped when reporting all options.
    pub(crate) alias: bool,
}

pub(crate) const OPTIONS: &[OptionDef] = &[
    OptionDef {
        name: "host",
        kind: OptKind::Conninfo { slot: 0, key: "host" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "hostaddr",
        kind: OptKind::Conninfo { slot: 1, key: "hostaddr" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "port",
        kind: OptKind::Port { slot: 2, key: "port" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "database",
        kind: OptKind::Conninfo { slot: 3, key: "dbname" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "db",
        kind: OptKind::Conninfo { slot: 3, key: "dbname" },
        modifiable: false,
        alias: true,
    },
    OptionDef {
        name: "user",
        kind: OptKind::Conninfo { slot: 4, key: "user" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "password",
        kind: OptKind::Conninfo { slot: 5, key: "password" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "options",
        kind: OptKind::Conninfo { slot: 6, key: "options" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "tty",
        kind: OptKind::Conninfo { slot: 7, key: "tty" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "service",
        kind: OptKind::Conninfo { slot: 8, key: "service" },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "timeout",
        kind: OptKind::Conninfo {
            slot: 9,
            key: "connect_timeout",
        },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "sslmode",
        kind: OptKind::Conninfo {
            slot: 10,
            key: "sslmode",
        },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "requiressl",
        kind: OptKind::Conninfo {
            slot: 11,
            key: "requiressl",
        },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "krbsrvname",
        kind: OptKind::Conninfo {
            slot: 12,
            key: "krbsrvname",
        },
        modifiable: false,
        alias: false,
    },
    OptionDef {
        name: "encoding",
        kind: OptKind::Encoding,
        modifiable: true,
        alias: false,
    },
    OptionDef {
        name: "isolation",
        kind: OptKind::Isolation,
        modifiable: true,
        alias: false,
    },
    OptionDef {
        name: "readonly",
        kind: OptKind::ReadOnly,
        modifiable: true,
        alias: false,
    },
    OptionDef {
        name: "attach",
        kind: OptKind::Attach,
        modifiable: false,
        alias: false,
    },
];

pub(crate) fn find_option(name: &str) -> Result<&'static OptionDef, Error> {
    OPTIONS
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| Error::Config(bad_option_message(name)))
}

fn bad_option_message(name: &str) -> String {
    let mut message = format!("bad option \"{name}\": must be ");
    for (i, def) in OPTIONS.iter().enumerate() {
        if i > 0 {
            message.push_str(if i + 1 == OPTIONS.len() { ", or " } else { ", " });
        }
        message.push_str(def.name);
    }
    message
}

/// Assemble the client connection string from the saved option values, in
/// option-table order: `key = 'value' ` pairs with a trailing space.
pub(crate) fn conninfo(saved: &[Option<String>]) -> String {
    let mut info = String::new();
    for def in OPTIONS {
        if def.alias {
            continue;
        }
        let (slot, key) = match def.kind {
            OptKind::Conninfo { slot, key } | OptKind::Port { slot, key } => (slot, key),
            _ => continue,
        };
        if let Some(value) = saved.get(slot).and_then(Option::as_ref) {
            // TODO escape embedded quotes in values
            info.push_str(key);
            info.push_str(" = '");
            info.push_str(value);
            info.push_str("' ");
        }
    }
    info
}

/// Parse and range-check a port value, returning its canonical decimal
/// spelling for the connection string.
pub(crate) fn validate_port(value: &str) -> Result<String, Error> {
    let port = value
        .trim()
        .parse::<i64>()
        .map_err(|_| Error::Config(format!("expected integer but got \"{value}\"")))?;
    if !(0..=0xffff).contains(&port) {
        return Err(Error::Config(
            "port number must be in range [0..65535]".to_string(),
        ));
    }
    Ok(port.to_string())
}

pub(crate) fn parse_isolation(value: &str) -> Result<IsolationLevel, Error> {
    IsolationLevel::from_name(value).ok_or_else(|| {
        Error::Config(format!(
            "bad isolation level \"{value}\": must be readuncommitted, \
             readcommitted, repeatableread, or serializable"
        ))
    })
}

/// Drop the first space of the server's isolation spelling, turning
/// `read committed` into the option value `readcommitted`.
pub(crate) fn collapse_isolation_name(server: &str) -> String {
    server.replacen(' ', "", 1)
}

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*PostgreSQL\s+(\d+)").expect("version pattern"));

/// Major version from the first cell of `SELECT version()`.
pub(crate) fn parse_major_version(banner: &str) -> Result<i32, Error> {
    VERSION_PATTERN
        .captures(banner)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .ok_or_else(|| Error::Config(format!("unable to parse PostgreSQL version: \"{banner}\"")))
}
