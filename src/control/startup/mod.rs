//! Read-only inventory of programs launched at logon.

mod registry;
mod xdg;

use crate::control::ControlError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(windows)]
pub use registry::RegistryRunSource;
pub use xdg::XdgAutostartSource;

/// Whether an entry applies to the current user or to every user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupLocation {
    User,
    System,
}

impl FromStr for StartupLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(StartupLocation::User),
            "system" | "machine" => Ok(StartupLocation::System),
            other => Err(format!("unknown startup location '{other}' (expected user or system)")),
        }
    }
}

impl fmt::Display for StartupLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StartupLocation::User => "user",
            StartupLocation::System => "system",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupEntry {
    pub name: String,
    pub command: String,
    pub location: StartupLocation,
    /// Registry key or desktop file the entry was read from.
    pub origin: String,
    pub enabled: bool,
}

/// Startup entry backend. Blocks.
pub trait StartupSource: Send + Sync {
    fn list(&self) -> Result<Vec<StartupEntry>, ControlError>;
}

pub struct UnsupportedStartupSource;

impl StartupSource for UnsupportedStartupSource {
    fn list(&self) -> Result<Vec<StartupEntry>, ControlError> {
        Err(ControlError::InstrumentationUnavailable(
            "no startup entry source on this platform".to_string(),
        ))
    }
}

/// Case-insensitive match on name or command.
pub fn filter_by_term(entries: Vec<StartupEntry>, term: &str) -> Vec<StartupEntry> {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return entries;
    }
    entries
        .into_iter()
        .filter(|e| {
            e.name.to_lowercase().contains(&needle) || e.command.to_lowercase().contains(&needle)
        })
        .collect()
}

pub fn filter_by_location(entries: Vec<StartupEntry>, location: StartupLocation) -> Vec<StartupEntry> {
    entries.into_iter().filter(|e| e.location == location).collect()
}

#[derive(Clone)]
pub struct StartupInventory {
    source: Arc<dyn StartupSource>,
}

impl StartupInventory {
    pub fn new(source: Arc<dyn StartupSource>) -> Self {
        Self { source }
    }

    pub fn host() -> Self {
        #[cfg(target_os = "linux")]
        let source: Arc<dyn StartupSource> = Arc::new(XdgAutostartSource::from_env());
        #[cfg(windows)]
        let source: Arc<dyn StartupSource> = Arc::new(RegistryRunSource);
        #[cfg(not(any(target_os = "linux", windows)))]
        let source: Arc<dyn StartupSource> = Arc::new(UnsupportedStartupSource);
        Self::new(source)
    }

    /// All entries ordered by name.
    pub fn list(&self) -> Result<Vec<StartupEntry>, ControlError> {
        let mut entries = self.source.list()?;
        entries.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.origin.cmp(&b.origin))
        });
        Ok(entries)
    }

    pub fn search(&self, term: &str) -> Result<Vec<StartupEntry>, ControlError> {
        Ok(filter_by_term(self.list()?, term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<StartupEntry>);

    impl StartupSource for FixedSource {
        fn list(&self) -> Result<Vec<StartupEntry>, ControlError> {
            Ok(self.0.clone())
        }
    }

    fn entry(name: &str, command: &str, location: StartupLocation) -> StartupEntry {
        StartupEntry {
            name: name.to_string(),
            command: command.to_string(),
            location,
            origin: format!("{location}/{name}"),
            enabled: true,
        }
    }

    fn inventory() -> StartupInventory {
        StartupInventory::new(Arc::new(FixedSource(vec![
            entry("Zoom", "/opt/zoom/zoom --autostart", StartupLocation::User),
            entry("agent", "/usr/bin/ssh-agent -s", StartupLocation::System),
            entry("Backup", "/usr/local/bin/nightly", StartupLocation::User),
        ])))
    }

    #[test]
    fn lists_by_name_ignoring_case() {
        let names: Vec<String> = inventory().list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["agent", "Backup", "Zoom"]);
    }

    #[test]
    fn search_matches_name_or_command() {
        let inv = inventory();
        assert_eq!(inv.search("ZOOM").unwrap().len(), 1);
        assert_eq!(inv.search("ssh-agent").unwrap()[0].name, "agent");
        assert_eq!(inv.search("  ").unwrap().len(), 3);
        assert!(inv.search("steam").unwrap().is_empty());
    }

    #[test]
    fn location_filter() {
        let user = filter_by_location(inventory().list().unwrap(), StartupLocation::User);
        assert_eq!(user.len(), 2);
        assert_eq!("machine".parse::<StartupLocation>(), Ok(StartupLocation::System));
        assert!("boot".parse::<StartupLocation>().is_err());
    }

    #[test]
    fn unsupported_host_reports_unavailable() {
        let inv = StartupInventory::new(Arc::new(UnsupportedStartupSource));
        assert!(matches!(inv.list(), Err(ControlError::InstrumentationUnavailable(_))));
    }
}
