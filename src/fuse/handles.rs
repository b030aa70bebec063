use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fs::ops::FileContext;

#[derive(Debug, Clone)]
pub struct HandleState {
    pub fh: u64,
    /// Caller path the handle was opened on.
    pub path: String,
    pub context: FileContext,
}

/// Open file and directory handles.
pub struct HandleTable {
    handles: DashMap<u64, HandleState>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, path: String, context: FileContext) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let state = HandleState { fh, path, context };
        self.handles.insert(fh, state);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, HandleState>> {
        self.handles.get(&fh)
    }

    pub fn remove(&self, fh: u64) -> Option<HandleState> {
        self.handles.remove(&fh).map(|(_, v)| v)
    }

    /// Re-point open handles after a rename.
    pub fn rename(&self, old_path: &str, new_path: &str) {
        for mut handle in self.handles.iter_mut() {
            if handle.path == old_path {
                handle.path = new_path.to_string();
            }
        }
    }
}
