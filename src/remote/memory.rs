//! In-memory store for tests.
//!
//! Counts mutating calls, tracks how many transfers run at once and records
//! the order of operations, so scheduling properties can be asserted.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::DriveError;
use crate::remote::{NewEntry, RemoteEntry, RemoteStore, ROOT_ID};

struct Stored {
    entry: RemoteEntry,
    content: Vec<u8>,
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, Stored>>,
    next_id: AtomicUsize,
    mutations: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    events: Mutex<Vec<String>>,
    failing_names: Mutex<HashSet<String>>,
    expired: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_ID.to_string(),
            Stored {
                entry: RemoteEntry {
                    id: ROOT_ID.to_string(),
                    name: "My Drive".to_string(),
                    parents: Vec::new(),
                    is_dir: true,
                    size: 0,
                    content_hash: None,
                    modified: Utc::now(),
                },
                content: Vec::new(),
            },
        );
        Self {
            entries: Mutex::new(entries),
            next_id: AtomicUsize::new(1),
            mutations: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::ZERO,
            events: Mutex::new(Vec::new()),
            failing_names: Mutex::new(HashSet::new()),
            expired: Mutex::new(false),
        }
    }

    /// Make every content transfer take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make creates and updates of entries named `name` fail.
    pub fn fail_on(&self, name: &str) {
        self.failing_names.lock().unwrap().insert(name.to_string());
    }

    /// Make every following call fail with an authorization error.
    pub fn expire_credentials(&self) {
        *self.expired.lock().unwrap() = true;
    }

    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Operation log such as `mkdir:dir` or `upload:b.txt`.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Insert a file directly, bypassing counters.
    pub fn seed_file(
        &self,
        parent: &str,
        name: &str,
        content: &[u8],
        modified: DateTime<Utc>,
    ) -> RemoteEntry {
        self.seed(parent, name, false, content, modified)
    }

    /// Insert a folder directly, bypassing counters.
    pub fn seed_folder(&self, parent: &str, name: &str) -> RemoteEntry {
        self.seed(parent, name, true, b"", Utc::now())
    }

    fn seed(
        &self,
        parent: &str,
        name: &str,
        is_dir: bool,
        content: &[u8],
        modified: DateTime<Utc>,
    ) -> RemoteEntry {
        let id = format!("id{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = RemoteEntry {
            id: id.clone(),
            name: name.to_string(),
            parents: vec![parent.to_string()],
            is_dir,
            size: content.len() as u64,
            content_hash: if is_dir {
                None
            } else {
                Some(blake3::hash(content).to_hex().to_string())
            },
            modified,
        };
        self.entries.lock().unwrap().insert(
            id,
            Stored {
                entry: entry.clone(),
                content: content.to_vec(),
            },
        );
        entry
    }

    pub fn content_of(&self, id: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|stored| stored.content.clone())
    }

    /// Find a child by name (first match).
    pub fn child(&self, parent: &str, name: &str) -> Option<RemoteEntry> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .find(|s| s.entry.name == name && s.entry.parents.iter().any(|p| p == parent))
            .map(|s| s.entry.clone())
    }

    fn check_credentials(&self) -> Result<(), DriveError> {
        if *self.expired.lock().unwrap() {
            return Err(DriveError::AuthExpired("token expired".to_string()));
        }
        Ok(())
    }

    fn check_failure(&self, name: &str) -> Result<(), DriveError> {
        if self.failing_names.lock().unwrap().contains(name) {
            return Err(DriveError::Remote(format!("injected failure for {}", name)));
        }
        Ok(())
    }

    /// Run `f` as one tracked transfer.
    fn transfer<T>(&self, f: impl FnOnce() -> T) -> T {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = f();
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl RemoteStore for MemoryStore {
    fn create(
        &self,
        entry: &NewEntry,
        content: Option<&mut dyn Read>,
    ) -> Result<RemoteEntry, DriveError> {
        self.check_credentials()?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check_failure(&entry.name)?;

        let mut bytes = Vec::new();
        if let Some(reader) = content {
            reader.read_to_end(&mut bytes)?;
        }

        let work = || {
            let mut entries = self.entries.lock().unwrap();
            for parent in &entry.parents {
                match entries.get(parent) {
                    Some(stored) if stored.entry.is_dir => {}
                    _ => return Err(DriveError::RemoteNotFound { id: parent.clone() }),
                }
            }
            let id = format!("id{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let created = RemoteEntry {
                id: id.clone(),
                name: entry.name.clone(),
                parents: entry.parents.clone(),
                is_dir: entry.is_dir,
                size: bytes.len() as u64,
                content_hash: if entry.is_dir {
                    None
                } else {
                    Some(blake3::hash(&bytes).to_hex().to_string())
                },
                modified: entry.modified.unwrap_or_else(Utc::now),
            };
            entries.insert(
                id,
                Stored {
                    entry: created.clone(),
                    content: bytes.clone(),
                },
            );
            let verb = if entry.is_dir { "mkdir" } else { "upload" };
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}", verb, entry.name));
            Ok(created)
        };

        if entry.is_dir {
            work()
        } else {
            self.transfer(work)
        }
    }

    fn update(
        &self,
        id: &str,
        content: &mut dyn Read,
        modified: Option<DateTime<Utc>>,
    ) -> Result<RemoteEntry, DriveError> {
        self.check_credentials()?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let name = self.get(id)?.name;
        self.check_failure(&name)?;

        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes)?;
        self.transfer(|| {
            let mut entries = self.entries.lock().unwrap();
            let stored = entries
                .get_mut(id)
                .ok_or_else(|| DriveError::RemoteNotFound { id: id.to_string() })?;
            stored.entry.size = bytes.len() as u64;
            stored.entry.content_hash = Some(blake3::hash(&bytes).to_hex().to_string());
            stored.entry.modified = modified.unwrap_or_else(Utc::now);
            stored.content = bytes.clone();
            self.events.lock().unwrap().push(format!("update:{}", name));
            Ok(stored.entry.clone())
        })
    }

    fn delete(&self, id: &str) -> Result<(), DriveError> {
        self.check_credentials()?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        let removed = entries
            .remove(id)
            .ok_or_else(|| DriveError::RemoteNotFound { id: id.to_string() })?;
        let mut gone = vec![id.to_string()];
        while let Some(parent) = gone.pop() {
            let children: Vec<String> = entries
                .iter()
                .filter(|(_, s)| s.entry.parents.iter().any(|p| p == &parent))
                .map(|(child, _)| child.clone())
                .collect();
            for child in children {
                entries.remove(&child);
                gone.push(child);
            }
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("delete:{}", removed.entry.name));
        Ok(())
    }

    fn list(&self, parent_id: &str) -> Result<Vec<RemoteEntry>, DriveError> {
        self.check_credentials()?;
        let entries = self.entries.lock().unwrap();
        if !entries.contains_key(parent_id) {
            return Err(DriveError::RemoteNotFound {
                id: parent_id.to_string(),
            });
        }
        let mut children: Vec<RemoteEntry> = entries
            .values()
            .filter(|s| s.entry.parents.iter().any(|p| p == parent_id))
            .map(|s| s.entry.clone())
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    fn content_hash(&self, id: &str) -> Result<Option<String>, DriveError> {
        Ok(self.get(id)?.content_hash)
    }

    fn get(&self, id: &str) -> Result<RemoteEntry, DriveError> {
        self.check_credentials()?;
        self.entries
            .lock()
            .unwrap()
            .get(id)
            .map(|s| s.entry.clone())
            .ok_or_else(|| DriveError::RemoteNotFound { id: id.to_string() })
    }

    fn open_read(&self, id: &str) -> Result<Box<dyn Read + Send>, DriveError> {
        self.check_credentials()?;
        let content = self.transfer(|| self.content_of(id));
        let content = content.ok_or_else(|| DriveError::RemoteNotFound { id: id.to_string() })?;
        self.events
            .lock()
            .unwrap()
            .push(format!("download:{}", self.get(id)?.name));
        Ok(Box::new(std::io::Cursor::new(content)))
    }
}
