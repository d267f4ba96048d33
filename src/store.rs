//! Durable storage for the policy.
//!
//! The whole policy is one JSON document (`config.json`). Writes go to a
//! temporary file in the same directory which is then renamed over the
//! destination, so a reader only ever sees the previous or the new
//! complete snapshot. A file with a different schema version, or one that
//! does not parse, is deleted and replaced by the default snapshot.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use crate::error::{Error, Result};
use crate::proxy::ProxyConfig;
use crate::ruleset::Rule;

/// Schema version written by this build.
pub const SCHEMA_VERSION: &str = "2";

/// File name inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Global toggles and preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "enabled")]
    pub dns_via_proxy: bool,
    #[serde(default)]
    pub localhost_via_proxy: bool,
    #[serde(default = "enabled")]
    pub traffic_logging_enabled: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "enabled")]
    pub close_to_tray: bool,
}

fn enabled() -> bool {
    true
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dns_via_proxy: true,
            localhost_via_proxy: false,
            traffic_logging_enabled: true,
            language: default_language(),
            close_to_tray: true,
        }
    }
}

/// Plain-data image of the whole policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: String,
    #[serde(flatten)]
    pub settings: Settings,
    #[serde(default)]
    pub proxy_configs: Vec<ProxyConfig>,
    /// Sorted by position
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            settings: Settings::default(),
            proxy_configs: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.proxy_configs.is_empty() && self.rules.is_empty()
    }
}

/// Location-bound reader/writer for [`Snapshot`]s.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the platform configuration directory.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_location()?))
    }

    /// `config.json` inside the platform configuration directory.
    pub fn default_location() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "procroute", "procroute").ok_or_else(|| {
            Error::Persistence("could not determine configuration directory".to_string())
        })?;
        Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot. Failures are logged and reported as `false`.
    pub fn save(&self, snapshot: &Snapshot) -> bool {
        match self.try_save(snapshot) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to save {}: {}", self.path.display(), e);
                false
            }
        }
    }

    pub fn try_save(&self, snapshot: &Snapshot) -> Result<()> {
        write_atomic(&self.path, |w| {
            serde_json::to_writer_pretty(&mut *w, snapshot)?;
            w.write_all(b"\n")
        })?;
        log::debug!(
            "Saved {} rules and {} proxy configs to {}",
            snapshot.rules.len(),
            snapshot.proxy_configs.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the persisted snapshot.
    ///
    /// Never fails: a missing or unreadable file yields the default
    /// snapshot; a corrupt or stale-schema file is deleted first.
    pub fn load(&self) -> Snapshot {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", self.path.display());
                return Snapshot::default();
            }
            Err(e) => {
                log::warn!("Failed to read {}: {}", self.path.display(), e);
                return Snapshot::default();
            }
        };

        match serde_json::from_slice::<Snapshot>(&data) {
            Ok(snapshot) if snapshot.version == SCHEMA_VERSION => {
                log::info!(
                    "Loaded {} rules and {} proxy configs from {}",
                    snapshot.rules.len(),
                    snapshot.proxy_configs.len(),
                    self.path.display()
                );
                snapshot
            }
            Ok(snapshot) => {
                log::warn!(
                    "Config version {:?} does not match {:?}, discarding {}",
                    snapshot.version,
                    SCHEMA_VERSION,
                    self.path.display()
                );
                self.discard();
                Snapshot::default()
            }
            Err(e) => {
                log::warn!("Corrupt config {}: {}, discarding", self.path.display(), e);
                self.discard();
                Snapshot::default()
            }
        }
    }

    fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Write `path` through a sibling temporary file and an atomic rename.
///
/// If `write` fails, or anything after it, the temporary file is removed
/// and `path` is left as it was.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = io::BufWriter::new(temp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

enum Job {
    Save(Box<Snapshot>),
    Flush(mpsc::Sender<()>),
}

/// Background writer so saves never block the caller.
///
/// Saves run one at a time in submission order; when several are queued
/// only the newest is written. Dropping the worker writes whatever is
/// still queued.
pub struct SaveWorker {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SaveWorker {
    pub fn spawn(store: ConfigStore) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("procroute-save".to_string())
            .spawn(move || run_saves(store, receiver))?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue a snapshot for writing.
    pub fn submit(&self, snapshot: Snapshot) {
        if let Some(sender) = &self.sender {
            if sender.send(Job::Save(Box::new(snapshot))).is_err() {
                log::warn!("Save worker has stopped; snapshot not written");
            }
        }
    }

    /// Block until every snapshot submitted so far has been written.
    pub fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done, wait) = mpsc::channel();
        if sender.send(Job::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }
}

impl Drop for SaveWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Save worker panicked");
            }
        }
    }
}

fn run_saves(store: ConfigStore, receiver: mpsc::Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        let mut latest = None;
        let mut waiters = Vec::new();
        let mut next = Some(job);

        // Collapse everything already queued into one write.
        while let Some(job) = next {
            match job {
                Job::Save(snapshot) => latest = Some(snapshot),
                Job::Flush(done) => waiters.push(done),
            }
            next = receiver.try_recv().ok();
        }

        if let Some(snapshot) = latest {
            store.save(&snapshot);
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
}
