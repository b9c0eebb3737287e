//! Test fixtures for backend tests
//!
//! Provides reusable server directories and helpers to compare them.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A hosted server's files as (relative path, contents).
pub struct TestWorld {
    pub files: Vec<(&'static str, Vec<u8>)>,
}

impl TestWorld {
    /// A small game server: config, a world with region files, and a log.
    pub fn game_server() -> Self {
        Self {
            files: vec![
                ("server.properties", b"motd=Backup test\nmax-players=20\n".to_vec()),
                ("world/level.dat", b"level-data".to_vec()),
                ("world/region/r.0.0.mca", vec![0xA5; 16 * 1024]),
                ("world/region/r.0.1.mca", (0..8192u32).map(|i| (i % 251) as u8).collect()),
                ("logs/latest.log", b"[00:00:00] Server started\n".to_vec()),
            ],
        }
    }

    pub fn write_to(&self, dir: &Path) {
        for (rel, data) in &self.files {
            let path = dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
    }
}

/// Hash of every file path and content under `dir`.
pub fn tree_hash(dir: &Path) -> String {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.unwrap();
        let rel = entry
            .path()
            .strip_prefix(dir)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let contents = if entry.file_type().is_file() {
            std::fs::read(entry.path()).unwrap()
        } else {
            Vec::new()
        };
        files.insert(rel, contents);
    }

    let mut hasher = Sha256::new();
    for (rel, contents) in files {
        hasher.update(rel.as_bytes());
        hasher.update([0]);
        hasher.update(&contents);
    }
    hex::encode(hasher.finalize())
}

/// Total size of regular files under `dir`.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
