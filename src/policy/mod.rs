//! Block/allow policy sets parsed from RPZ-style zone files.
//!
//! Another system writes the two files; this module only reads them. Each
//! reload replaces a whole snapshot behind an `ArcSwap`, so lookups never see
//! a partially built set and a read failure never empties one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::debug;

pub const DEFAULT_BLOCKLIST_PATH: &str = "/shared/rpz/blocklist-combined.rpz";
pub const DEFAULT_ALLOWLIST_PATH: &str = "/shared/rpz/whitelist.rpz";

/// Minimum time between reload attempts.
const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Throttled, snapshot-swapped block/allow domain sets.
pub struct PolicyStore {
    blocklist_path: PathBuf,
    allowlist_path: PathBuf,
    blocked: ArcSwap<HashSet<String>>,
    allow: ArcSwap<HashSet<String>>,
    last_attempt: Mutex<Option<Instant>>,
    reload_interval: Duration,
}

impl PolicyStore {
    pub fn new(blocklist: impl Into<PathBuf>, allowlist: impl Into<PathBuf>) -> Self {
        Self {
            blocklist_path: blocklist.into(),
            allowlist_path: allowlist.into(),
            blocked: ArcSwap::from_pointee(HashSet::new()),
            allow: ArcSwap::from_pointee(HashSet::new()),
            last_attempt: Mutex::new(None),
            reload_interval: RELOAD_INTERVAL,
        }
    }

    /// Overrides the reload throttle interval.
    pub fn with_reload_interval(mut self, interval: Duration) -> Self {
        self.reload_interval = interval;
        self
    }

    /// True when `norm_qname` is block-listed and not allow-listed.
    ///
    /// Expects an already-normalized name (lowercase, no trailing dot).
    /// Triggers a throttled reload of both files.
    pub fn is_blocked(&self, norm_qname: &str) -> bool {
        self.maybe_reload();
        if !self.blocked.load().contains(norm_qname) {
            return false;
        }
        !self.allow.load().contains(norm_qname)
    }

    /// Reloads both files unless a reload ran within the throttle interval.
    fn maybe_reload(&self) {
        {
            let mut last = self
                .last_attempt
                .lock()
                .expect("policy reload lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < self.reload_interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        self.reload_now();
    }

    fn reload_now(&self) {
        match load_set(&self.blocklist_path) {
            Ok(set) => self.blocked.store(Arc::new(set)),
            Err(e) => debug!(
                path = %self.blocklist_path.display(),
                error = %e,
                "blocklist read failed, keeping previous snapshot",
            ),
        }
        match load_set(&self.allowlist_path) {
            Ok(set) => self.allow.store(Arc::new(set)),
            Err(e) => debug!(
                path = %self.allowlist_path.display(),
                error = %e,
                "allowlist read failed, keeping previous snapshot",
            ),
        }
    }
}

/// Parses one RPZ-ish zone file into a set of normalized domains.
///
/// One rule per line; blank lines and lines starting with `;`, `#`, or `$`
/// are skipped. The rule's domain is the first whitespace-separated token,
/// stripped of one trailing dot and lowercased. Empty and `@` entries drop.
fn load_set(path: &Path) -> std::io::Result<HashSet<String>> {
    let text = std::fs::read_to_string(path)?;
    let mut set = HashSet::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') || line.starts_with('$')
        {
            continue;
        }
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        let token = token.strip_suffix('.').unwrap_or(token);
        let domain = token.to_ascii_lowercase();
        if domain.is_empty() || domain == "@" {
            continue;
        }
        set.insert(domain);
    }

    Ok(set)
}
