//! Device discovery and connection construction.
//!
//! A [`ConnectionRegistry`] holds one [`ConnectionEntry`] per transport
//! kind. Entries enumerate the boards they can reach as
//! [`ConnectionHandle`]s and build a [`Connection`] (an unopened transport
//! plus the board's channel counts) for a chosen handle.
//!
//! Handles serialize to a comma-separated string that parses back to an
//! equal handle:
//!
//! ```text
//! LimeSDR-QPCIe, media=PCIe, module=PCIEXillybus, addr=/dev, index=0
//! ```
//!
//! A backslash escapes `\`, `,`, `=` and edge whitespace inside values.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::error::{LmsError, Result};
use crate::transport::{DeviceFilePaths, MailboxLayout, MappedMailbox, TransportChannel};

/// Identifies one physical board. Empty fields are "unknown"/"any".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Connection entry that produced the handle.
    pub module: String,
    /// Physical medium (`PCIe`, `MMIO`, ...).
    pub media: String,
    /// Board name.
    pub name: String,
    /// Transport address (device directory, mapped file, ...).
    pub addr: String,
    /// Board serial number.
    pub serial: String,
    /// Index among boards of the same module.
    pub index: Option<u32>,
}

impl ConnectionHandle {
    /// Handle matching every board of `module`.
    pub fn for_module(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Self::default()
        }
    }

    /// Whether `self` satisfies every field set in `hint`.
    pub fn matches(&self, hint: &ConnectionHandle) -> bool {
        let field = |mine: &str, wanted: &str| wanted.is_empty() || mine == wanted;
        field(&self.module, &hint.module)
            && field(&self.media, &hint.media)
            && field(&self.name, &hint.name)
            && field(&self.addr, &hint.addr)
            && field(&self.serial, &hint.serial)
            && hint.index.map_or(true, |i| self.index == Some(i))
    }
}

/// Append `value` with `\`, `,` and `=` escaped, plus any leading or
/// trailing whitespace, so the parser can neither split nor trim it.
fn push_escaped(out: &mut String, value: &str) {
    let start = value.len() - value.trim_start().len();
    let end = value.trim_end().len();
    for (i, c) in value.char_indices() {
        if matches!(c, '\\' | ',' | '=') || (c.is_whitespace() && (i < start || i >= end)) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// A character of a handle string and whether it was escaped.
type Lexeme = (char, bool);

fn trim_unescaped(mut token: &[Lexeme]) -> &[Lexeme] {
    while let [(c, false), rest @ ..] = token {
        if !c.is_whitespace() {
            break;
        }
        token = rest;
    }
    while let [rest @ .., (c, false)] = token {
        if !c.is_whitespace() {
            break;
        }
        token = rest;
    }
    token
}

/// Split on unescaped commas, resolving escapes.
fn split_fields(s: &str) -> Result<Vec<Vec<Lexeme>>> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next().ok_or_else(|| {
                    LmsError::invalid_argument("handle ends with a dangling escape")
                })?;
                current.push((escaped, true));
            }
            ',' => fields.push(std::mem::take(&mut current)),
            c => current.push((c, false)),
        }
    }
    fields.push(current);
    Ok(fields)
}

fn collect(lexemes: &[Lexeme]) -> String {
    lexemes.iter().map(|(c, _)| c).collect()
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let sep = |out: &mut String| {
            if !out.is_empty() {
                out.push_str(", ");
            }
        };
        if !self.name.is_empty() {
            push_escaped(&mut out, &self.name);
        }
        for (key, value) in [
            ("media", &self.media),
            ("module", &self.module),
            ("addr", &self.addr),
            ("serial", &self.serial),
        ] {
            if !value.is_empty() {
                sep(&mut out);
                out.push_str(key);
                out.push('=');
                push_escaped(&mut out, value);
            }
        }
        if let Some(index) = self.index {
            sep(&mut out);
            out.push_str("index=");
            out.push_str(&index.to_string());
        }
        f.write_str(&out)
    }
}

impl FromStr for ConnectionHandle {
    type Err = LmsError;

    fn from_str(s: &str) -> Result<Self> {
        let mut handle = Self::default();
        for field in split_fields(s)? {
            let token = trim_unescaped(&field);
            if token.is_empty() {
                continue;
            }
            let Some(eq) = token.iter().position(|&l| l == ('=', false)) else {
                handle.name = collect(token);
                continue;
            };
            let key = collect(trim_unescaped(&token[..eq]));
            let value = collect(trim_unescaped(&token[eq + 1..]));
            match key.as_str() {
                "media" => handle.media = value,
                "module" => handle.module = value,
                "addr" => handle.addr = value,
                "serial" => handle.serial = value,
                "name" => handle.name = value,
                "index" => {
                    handle.index = Some(value.parse().map_err(|_| {
                        LmsError::invalid_argument(format!("bad index '{value}' in handle"))
                    })?)
                }
                other => {
                    return Err(LmsError::invalid_argument(format!(
                        "unknown handle field '{other}'"
                    )))
                }
            }
        }
        Ok(handle)
    }
}

/// An unopened link to a board.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Board this connection reaches.
    pub handle: ConnectionHandle,
    /// Control and data channels, not yet open.
    pub transport: Arc<TransportChannel>,
    /// RX channels the board provides.
    pub rx_channels: usize,
    /// TX channels the board provides.
    pub tx_channels: usize,
}

/// One transport kind in the registry.
pub trait ConnectionEntry: Send + Sync {
    /// Module name recorded in handles.
    fn module(&self) -> &str;
    /// Boards reachable through this entry that match `hint`.
    fn enumerate(&self, hint: &ConnectionHandle) -> Vec<ConnectionHandle>;
    /// Build a connection for `handle`. Does not open it.
    fn make(&self, handle: &ConnectionHandle) -> Result<Connection>;
}

/// Xillybus PCIe boards: paired device files for control and data.
#[derive(Debug, Clone)]
pub struct XillybusEntry {
    paths: DeviceFilePaths,
    addr: String,
    rx_channels: usize,
    tx_channels: usize,
    retry_interval: std::time::Duration,
}

impl XillybusEntry {
    /// Module name.
    pub const MODULE: &'static str = "PCIEXillybus";

    /// Entry using the `[xillybus]` and `[transport]` sections.
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            paths: DeviceFilePaths::xillybus(&config.xillybus.device_dir),
            addr: config.xillybus.device_dir.display().to_string(),
            rx_channels: config.xillybus.rx_channels,
            tx_channels: config.xillybus.tx_channels,
            retry_interval: config.retry_interval(),
        }
    }
}

impl ConnectionEntry for XillybusEntry {
    fn module(&self) -> &str {
        Self::MODULE
    }

    fn enumerate(&self, hint: &ConnectionHandle) -> Vec<ConnectionHandle> {
        if !self.paths.control_present() {
            debug!(addr = %self.addr, "No Xillybus control nodes");
            return Vec::new();
        }
        let handle = ConnectionHandle {
            module: Self::MODULE.to_string(),
            media: "PCIe".to_string(),
            name: "LimeSDR-QPCIe".to_string(),
            addr: self.addr.clone(),
            serial: String::new(),
            index: Some(0),
        };
        if handle.matches(hint) {
            vec![handle]
        } else {
            Vec::new()
        }
    }

    fn make(&self, handle: &ConnectionHandle) -> Result<Connection> {
        let transport =
            TransportChannel::device_files(&self.paths).with_retry_interval(self.retry_interval);
        Ok(Connection {
            handle: handle.clone(),
            transport: Arc::new(transport),
            rx_channels: self.rx_channels,
            tx_channels: self.tx_channels,
        })
    }
}

/// Boards exposing only a memory-mapped control mailbox. No streaming.
#[derive(Debug, Clone)]
pub struct MailboxEntry {
    path: std::path::PathBuf,
    layout: MailboxLayout,
}

impl MailboxEntry {
    /// Module name.
    pub const MODULE: &'static str = "MappedMailbox";

    /// Entry for the mailbox at `path`.
    pub fn new(path: impl Into<std::path::PathBuf>, layout: MailboxLayout) -> Self {
        Self {
            path: path.into(),
            layout,
        }
    }
}

impl ConnectionEntry for MailboxEntry {
    fn module(&self) -> &str {
        Self::MODULE
    }

    fn enumerate(&self, hint: &ConnectionHandle) -> Vec<ConnectionHandle> {
        if !self.path.exists() {
            return Vec::new();
        }
        let handle = ConnectionHandle {
            module: Self::MODULE.to_string(),
            media: "MMIO".to_string(),
            name: String::new(),
            addr: self.path.display().to_string(),
            serial: String::new(),
            index: Some(0),
        };
        if handle.matches(hint) {
            vec![handle]
        } else {
            Vec::new()
        }
    }

    fn make(&self, handle: &ConnectionHandle) -> Result<Connection> {
        let mailbox = MappedMailbox::new(&self.path, self.layout);
        Ok(Connection {
            handle: handle.clone(),
            transport: Arc::new(TransportChannel::mapped_mailbox(mailbox)),
            rx_channels: 0,
            tx_channels: 0,
        })
    }
}

/// Set of connection entries searched by enumeration.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Vec<Arc<dyn ConnectionEntry>>,
}

impl ConnectionRegistry {
    /// Registry with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the entries enabled in `config`.
    pub fn with_defaults(config: &DriverConfig) -> Self {
        let mut registry = Self::new();
        if config.xillybus.enabled {
            registry.register(Arc::new(XillybusEntry::from_config(config)));
        }
        if let Some(path) = &config.mailbox.path {
            let layout = MailboxLayout::new(config.mailbox.offset, config.mailbox.capacity);
            registry.register(Arc::new(MailboxEntry::new(path, layout)));
        }
        registry
    }

    /// Add an entry, replacing any entry with the same module name.
    pub fn register(&mut self, entry: Arc<dyn ConnectionEntry>) {
        self.entries.retain(|e| e.module() != entry.module());
        info!(module = entry.module(), "Registered connection entry");
        self.entries.push(entry);
    }

    /// Remove the entry named `module`. Returns whether one was removed.
    pub fn unregister(&mut self, module: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.module() != module);
        self.entries.len() != before
    }

    /// Registered module names.
    pub fn modules(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.module().to_string()).collect()
    }

    /// Every reachable board matching `hint`.
    pub fn find_connections(&self, hint: &ConnectionHandle) -> Vec<ConnectionHandle> {
        let found: Vec<ConnectionHandle> = self
            .entries
            .iter()
            .filter(|e| hint.module.is_empty() || e.module() == hint.module)
            .flat_map(|e| e.enumerate(hint))
            .collect();
        debug!(hint = %hint, found = found.len(), "Enumerated connections");
        found
    }

    /// Build a connection through the entry named in `handle.module`.
    pub fn make_connection(&self, handle: &ConnectionHandle) -> Result<Connection> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.module() == handle.module)
            .ok_or_else(|| {
                LmsError::not_connected(format!("no connection entry for module '{}'", handle.module))
            })?;
        entry.make(handle)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("modules", &self.modules())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_round_trip() {
        let handle = ConnectionHandle {
            module: "PCIEXillybus".to_string(),
            media: "PCIe".to_string(),
            name: "LimeSDR-QPCIe".to_string(),
            addr: "/dev".to_string(),
            serial: "0009060B00471B1F".to_string(),
            index: Some(0),
        };
        let text = handle.to_string();
        assert_eq!(
            text,
            "LimeSDR-QPCIe, media=PCIe, module=PCIEXillybus, addr=/dev, serial=0009060B00471B1F, index=0"
        );
        assert_eq!(text.parse::<ConnectionHandle>().unwrap(), handle);
    }

    #[test]
    fn test_separators_in_values_are_escaped() {
        let handle = ConnectionHandle {
            module: "PCIEXillybus".to_string(),
            name: "Lime=QPCIe".to_string(),
            addr: "/dev/lime,0".to_string(),
            serial: " 42 ".to_string(),
            ..ConnectionHandle::default()
        };
        let text = handle.to_string();
        assert_eq!(
            text,
            r"Lime\=QPCIe, module=PCIEXillybus, addr=/dev/lime\,0, serial=\ 42\ "
        );
        assert_eq!(text.parse::<ConnectionHandle>().unwrap(), handle);
    }

    #[test]
    fn test_dangling_escape_is_rejected() {
        let err = r"addr=/dev\".parse::<ConnectionHandle>().unwrap_err();
        assert!(matches!(err, LmsError::InvalidArgument { .. }));
    }

    #[test]
    fn test_empty_handle() {
        let handle = ConnectionHandle::default();
        assert_eq!(handle.to_string(), "");
        assert_eq!("".parse::<ConnectionHandle>().unwrap(), handle);
    }

    #[test]
    fn test_parse_errors() {
        assert!("index=abc".parse::<ConnectionHandle>().is_err());
        assert!("colour=red".parse::<ConnectionHandle>().is_err());
    }

    #[test]
    fn test_matches_uses_only_set_fields() {
        let handle: ConnectionHandle = "Board, media=PCIe, module=M, index=1".parse().unwrap();
        assert!(handle.matches(&ConnectionHandle::default()));
        assert!(handle.matches(&ConnectionHandle::for_module("M")));
        assert!(!handle.matches(&ConnectionHandle::for_module("N")));
        let by_index = ConnectionHandle {
            index: Some(2),
            ..ConnectionHandle::default()
        };
        assert!(!handle.matches(&by_index));
    }

    #[test]
    fn test_xillybus_without_nodes_enumerates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DriverConfig::default();
        config.xillybus.device_dir = dir.path().to_path_buf();
        let registry = ConnectionRegistry::with_defaults(&config);
        assert!(registry.find_connections(&ConnectionHandle::default()).is_empty());
    }

    #[test]
    fn test_xillybus_with_nodes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["xillybus_write_8", "xillybus_read_8"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let mut config = DriverConfig::default();
        config.xillybus.device_dir = dir.path().to_path_buf();
        let registry = ConnectionRegistry::with_defaults(&config);

        let found = registry.find_connections(&ConnectionHandle::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].module, XillybusEntry::MODULE);

        let connection = registry.make_connection(&found[0]).unwrap();
        assert_eq!(connection.rx_channels, 2);
        assert!(!connection.transport.is_open());
    }

    #[test]
    fn test_unknown_module_is_not_connected() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .make_connection(&ConnectionHandle::for_module("Nope"))
            .unwrap_err();
        assert!(err.is_not_connected());
    }

    #[test]
    fn test_register_replaces_same_module() {
        let mut registry = ConnectionRegistry::new();
        let config = DriverConfig::default();
        registry.register(Arc::new(XillybusEntry::from_config(&config)));
        registry.register(Arc::new(XillybusEntry::from_config(&config)));
        assert_eq!(registry.modules(), vec![XillybusEntry::MODULE.to_string()]);
        assert!(registry.unregister(XillybusEntry::MODULE));
        assert!(registry.modules().is_empty());
    }
}
