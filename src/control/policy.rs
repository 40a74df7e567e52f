/// Names of processes that must never be terminated, suspended or
/// reprioritised. An entry may contain one `*` wildcard.
pub const DEFAULT_PROTECTED_PROCESSES: &[&str] = &[
    "System",
    "System Idle Process",
    "Registry",
    "smss",
    "csrss",
    "wininit",
    "winlogon",
    "services",
    "lsass",
    "svchost",
    "init",
    "systemd",
    "kthreadd",
    "kworker/*",
];

/// Process-name protection check. Matching is case-insensitive and ignores a
/// trailing `.exe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionPolicy {
    patterns: Vec<String>,
}

impl ProtectionPolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        patterns.sort();
        patterns.dedup();
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_protected(&self, name: &str) -> bool {
        let name = normalize(name);
        if name.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| wildcard_match(p, &name))
    }
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PROTECTED_PROCESSES)
    }
}

fn normalize(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Exact match, or prefix and suffix around a single `*`.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, suffix)) => {
            text.len() >= prefix.len() + suffix.len()
                && text.starts_with(prefix)
                && text.ends_with(suffix)
        }
    }
}
