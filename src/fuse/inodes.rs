use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fs::paths;

pub const ROOT_INO: u64 = 1;

/// Synthetic inode numbers for caller paths. Objects in a bucket have no
/// inode of their own, so numbers are handed out on first sight and stay
/// stable for the life of the mount.
pub struct InodeTable {
    ino_to_path: DashMap<u64, String>,
    path_to_ino: DashMap<String, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            ino_to_path: DashMap::new(),
            path_to_ino: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        table.ino_to_path.insert(ROOT_INO, paths::ROOT.to_string());
        table.path_to_ino.insert(paths::ROOT.to_string(), ROOT_INO);
        table
    }

    /// Inode of `path`, allocating one if the path is new.
    pub fn ino_for(&self, path: &str) -> u64 {
        if let Some(ino) = self.path_to_ino.get(path) {
            return *ino.value();
        }
        let ino = *self
            .path_to_ino
            .entry(path.to_string())
            .or_insert_with(|| self.next_ino.fetch_add(1, Ordering::Relaxed))
            .value();
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    pub fn get_path(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).map(|r| r.value().clone())
    }

    pub fn remove_by_path(&self, path: &str) {
        if let Some((_, ino)) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    /// Move `old_path` and everything below it to `new_path`, keeping inodes.
    pub fn rename(&self, old_path: &str, new_path: &str) {
        let below = format!("{}/", old_path.trim_end_matches('/'));
        let moved: Vec<(String, u64)> = self
            .path_to_ino
            .iter()
            .filter(|r| r.key() == old_path || r.key().starts_with(&below))
            .map(|r| (r.key().clone(), *r.value()))
            .collect();

        self.remove_by_path(new_path);
        for (path, ino) in moved {
            let renamed = format!("{}{}", new_path, &path[old_path.len()..]);
            self.path_to_ino.remove(&path);
            self.path_to_ino.insert(renamed.clone(), ino);
            self.ino_to_path.insert(ino, renamed);
        }
    }
}
