use super::{StartupEntry, StartupLocation, StartupSource};
use crate::control::ControlError;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// XDG autostart directories. A desktop file in an earlier directory hides
/// the file with the same name in later ones.
pub struct XdgAutostartSource {
    dirs: Vec<(PathBuf, StartupLocation)>,
}

impl XdgAutostartSource {
    pub fn new(dirs: Vec<(PathBuf, StartupLocation)>) -> Self {
        Self { dirs }
    }

    /// `$XDG_CONFIG_HOME/autostart` then each `$XDG_CONFIG_DIRS/autostart`.
    pub fn from_env() -> Self {
        let mut dirs = Vec::new();
        let user_config = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(dirs_next::config_dir);
        if let Some(config) = user_config {
            dirs.push((config.join("autostart"), StartupLocation::User));
        }

        let system = std::env::var("XDG_CONFIG_DIRS")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "/etc/xdg".to_string());
        for dir in system.split(':').filter(|d| !d.is_empty()) {
            dirs.push((Path::new(dir).join("autostart"), StartupLocation::System));
        }
        Self::new(dirs)
    }
}

impl StartupSource for XdgAutostartSource {
    fn list(&self) -> Result<Vec<StartupEntry>, ControlError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (dir, location) in &self.dirs {
            let read = match fs::read_dir(dir) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    debug!(dir = %dir.display(), error = %err, "skipping autostart directory");
                    continue;
                }
            };

            let mut files: Vec<PathBuf> = read
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "desktop"))
                .collect();
            files.sort();

            for path in files {
                let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
                    continue;
                };
                if !seen.insert(file_name) {
                    continue;
                }
                let text = match fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "unreadable desktop file");
                        continue;
                    }
                };
                let Some(desktop) = parse_desktop_entry(&text) else {
                    continue;
                };
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                entries.push(StartupEntry {
                    name: desktop.name.unwrap_or(stem),
                    command: desktop.exec.unwrap_or_default(),
                    location: *location,
                    origin: path.display().to_string(),
                    enabled: desktop.enabled,
                });
            }
        }
        Ok(entries)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) struct DesktopEntry {
    pub name: Option<String>,
    pub exec: Option<String>,
    pub enabled: bool,
}

/// Reads the `[Desktop Entry]` group. `Hidden=true` and
/// `X-GNOME-Autostart-enabled=false` both mean disabled. Returns `None` for
/// files without that group or of a type other than `Application`.
pub(super) fn parse_desktop_entry(text: &str) -> Option<DesktopEntry> {
    let mut in_group = false;
    let mut found = false;
    let mut entry = DesktopEntry {
        name: None,
        exec: None,
        enabled: true,
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            in_group = line == "[Desktop Entry]";
            found |= in_group;
            continue;
        }
        if !in_group {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Type" if value != "Application" => return None,
            "Name" => entry.name = Some(value.to_string()),
            "Exec" => entry.exec = Some(value.to_string()),
            "Hidden" if value.eq_ignore_ascii_case("true") => entry.enabled = false,
            "X-GNOME-Autostart-enabled" if value.eq_ignore_ascii_case("false") => {
                entry.enabled = false
            }
            _ => {}
        }
    }

    found.then_some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIGHTLY: &str = "\
[Desktop Entry]
Type=Application
Name=Nightly Backup
Name[de]=Nächtliche Sicherung
Exec=/usr/local/bin/nightly --quiet
X-GNOME-Autostart-enabled=true
";

    #[test]
    fn parses_desktop_entry() {
        let entry = parse_desktop_entry(NIGHTLY).unwrap();
        assert_eq!(entry.name.as_deref(), Some("Nightly Backup"));
        assert_eq!(entry.exec.as_deref(), Some("/usr/local/bin/nightly --quiet"));
        assert!(entry.enabled);
    }

    #[test]
    fn disabled_and_foreign_entries() {
        let hidden = "[Desktop Entry]\nName=Tracker\nHidden=true\n";
        assert!(!parse_desktop_entry(hidden).unwrap().enabled);

        let gnome_off = "[Desktop Entry]\nExec=foo\nX-GNOME-Autostart-enabled=false\n";
        assert!(!parse_desktop_entry(gnome_off).unwrap().enabled);

        assert_eq!(parse_desktop_entry("[Desktop Entry]\nType=Link\nName=x\n"), None);
        assert_eq!(parse_desktop_entry("Name=no group\n"), None);

        // keys of other groups are ignored
        let actions = "[Desktop Entry]\nExec=app\n[Desktop Action New]\nExec=app --new\n";
        assert_eq!(parse_desktop_entry(actions).unwrap().exec.as_deref(), Some("app"));
    }

    #[test]
    fn user_file_hides_system_file_of_same_name() {
        let user = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        fs::write(
            user.path().join("tracker.desktop"),
            "[Desktop Entry]\nName=Tracker\nHidden=true\n",
        )
        .unwrap();
        fs::write(
            system.path().join("tracker.desktop"),
            "[Desktop Entry]\nName=Tracker\nExec=/usr/libexec/tracker\n",
        )
        .unwrap();
        fs::write(system.path().join("agent.desktop"), "[Desktop Entry]\nExec=ssh-agent\n").unwrap();
        fs::write(system.path().join("notes.txt"), "not a desktop file").unwrap();

        let source = XdgAutostartSource::new(vec![
            (user.path().to_path_buf(), StartupLocation::User),
            (system.path().to_path_buf(), StartupLocation::System),
            (PathBuf::from("/definitely/not/here"), StartupLocation::System),
        ]);
        let entries = source.list().unwrap();
        assert_eq!(entries.len(), 2);

        let tracker = entries.iter().find(|e| e.name == "Tracker").unwrap();
        assert_eq!(tracker.location, StartupLocation::User);
        assert!(!tracker.enabled);

        let agent = entries.iter().find(|e| e.command == "ssh-agent").unwrap();
        assert_eq!(agent.name, "agent");
        assert_eq!(agent.location, StartupLocation::System);
        assert!(agent.enabled);
    }
}
