//! Per-user navigation state
//!
//! Each user gets one [`UserSession`] holding the numbered view of the last
//! listed directory, the stack of directories they descended from, and their
//! upload-wait intent. Sessions live in a [`SessionRegistry`], are created on
//! first use and are never persisted.

use crate::api::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

// ============================================================================
// PATHS
// ============================================================================

/// Normalize a remote path: collapse duplicate slashes, drop `.`, resolve
/// `..` (never above root), strip any trailing slash, ensure a leading `/`.
pub fn normalize_path(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.trim().split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Resolve user input against the current directory. Absolute input stands
/// on its own, relative input is joined onto `current`.
pub fn resolve_path(current: &str, input: &str) -> String {
    let input = input.trim();
    if input.starts_with('/') {
        normalize_path(input)
    } else {
        normalize_path(&format!("{}/{}", current, input))
    }
}

/// `dir` + `/` + `name`, without doubling the separator at root.
pub fn join_child(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// True when `new` lies strictly below `current`.
pub fn is_forward_navigation(current: &str, new: &str) -> bool {
    let current = current.trim_end_matches('/');
    let new = new.trim_end_matches('/');
    new.starts_with(&format!("{}/", current))
}

// ============================================================================
// NAVIGATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct NavigationState {
    current_path: String,
    items: Vec<Entry>,
    ancestors: Vec<String>,
}

impl Default for NavigationState {
    fn default() -> Self {
        Self {
            current_path: "/".to_string(),
            items: Vec::new(),
            ancestors: Vec::new(),
        }
    }
}

impl NavigationState {
    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn items(&self) -> &[Entry] {
        &self.items
    }

    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// Move to `path`. Descending pushes the old directory so it can be
    /// returned to; any other move just switches.
    pub fn enter(&mut self, path: &str) {
        let path = normalize_path(path);
        if path == self.current_path {
            return;
        }
        if is_forward_navigation(&self.current_path, &path) {
            let previous = std::mem::replace(&mut self.current_path, path);
            self.ancestors.push(previous);
        } else {
            self.current_path = path;
        }
    }

    /// Replace the indexed view: directories first, then files, each group in
    /// server order, cut to `max` entries.
    pub fn set_items(&mut self, entries: Vec<Entry>, max: usize) {
        let (mut dirs, files): (Vec<Entry>, Vec<Entry>) =
            entries.into_iter().partition(|e| e.is_dir);
        dirs.extend(files);
        dirs.truncate(max);
        self.items = dirs;
    }

    /// `enter` followed by `set_items`, for a freshly listed directory.
    pub fn show(&mut self, path: &str, entries: Vec<Entry>, max: usize) {
        self.enter(path);
        self.set_items(entries, max);
    }

    /// Entry at 1-based position `n` of the current view.
    pub fn resolve_index(&self, n: usize) -> Option<&Entry> {
        if n == 0 {
            return None;
        }
        self.items.get(n - 1)
    }

    /// Pop the most recent ancestor. `None` means the session is already at
    /// its root.
    pub fn go_back(&mut self) -> Option<String> {
        self.ancestors.pop()
    }

    pub fn peek_back(&self) -> Option<&str> {
        self.ancestors.last().map(String::as_str)
    }

    /// Land on a directory reached by going back: no history is recorded.
    pub fn restore(&mut self, path: &str, entries: Vec<Entry>, max: usize) {
        self.current_path = normalize_path(path);
        self.set_items(entries, max);
    }

    pub fn child_path(&self, name: &str) -> String {
        join_child(&self.current_path, name)
    }
}

// ============================================================================
// UPLOAD INTENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadIntent {
    waiting: bool,
    target_path: String,
    generation: u64,
}

impl Default for UploadIntent {
    fn default() -> Self {
        Self {
            waiting: false,
            target_path: "/".to_string(),
            generation: 0,
        }
    }
}

impl UploadIntent {
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    /// Begin waiting for an attachment. Returns the generation a deferred
    /// timeout must present to end this particular wait.
    pub fn start(&mut self, target_path: &str) -> u64 {
        self.generation += 1;
        self.waiting = true;
        self.target_path = target_path.to_string();
        self.generation
    }

    /// Returns whether a wait was actually cancelled.
    pub fn cancel(&mut self) -> bool {
        std::mem::replace(&mut self.waiting, false)
    }

    /// Claim the wait for an incoming attachment. The wait ends here, so a
    /// later `start` belongs to the next attachment and is left alone when
    /// this upload finishes.
    pub fn take(&mut self) -> Option<String> {
        if self.cancel() {
            Some(self.target_path.clone())
        } else {
            None
        }
    }

    /// Timeout path: only ends the wait it was scheduled for.
    pub fn expire(&mut self, generation: u64) -> bool {
        if self.waiting && self.generation == generation {
            self.waiting = false;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserSession {
    pub nav: NavigationState,
    pub upload: UploadIntent,
}

// ============================================================================
// REGISTRY
// ============================================================================

pub type SharedSession = Arc<Mutex<UserSession>>;

struct SessionSlot {
    session: SharedSession,
    last_access: u64,
}

/// All live sessions, keyed by user id, bounded by least-recent access.
pub struct SessionRegistry {
    sessions: std::sync::Mutex<HashMap<String, SessionSlot>>,
    capacity: usize,
    tick: AtomicU64,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: std::sync::Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
        }
    }

    /// Session for `user_id`, created on first use.
    pub fn session(&self, user_id: &str) -> SharedSession {
        let now = self.tick.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);

        let slot = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| SessionSlot {
                session: Arc::new(Mutex::new(UserSession::default())),
                last_access: now,
            });
        slot.last_access = now;
        let session = slot.session.clone();

        while sessions.len() > self.capacity {
            let oldest = sessions
                .iter()
                .filter(|(id, _)| id.as_str() != user_id)
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    tracing::debug!("evicting idle session for {}", id);
                    sessions.remove(&id);
                }
                None => break,
            }
        }

        session
    }

    /// Existing session without creating or touching one.
    pub fn get(&self, user_id: &str) -> Option<SharedSession> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(user_id).map(|slot| slot.session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
