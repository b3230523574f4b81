//! Device path conventions
//!
//! The iTunesDB stores file locations relative to the mount point with `:` as
//! separator (`:iPod_Control:Music:F07:kpod2007.mp3`). Artist and album names
//! used as index keys escape `/` as `%2f` so they never collide with host
//! separators.

use std::path::{Path, PathBuf};

/// Location of the database relative to the mount point
pub const ITUNESDB_PATH: &str = "iPod_Control/iTunes/iTunesDB";
/// Shuffle database, only present on shuffle-style devices
pub const ITUNESSD_PATH: &str = "iPod_Control/iTunes/iTunesSD";
/// Directory holding the music fan-out folders
pub const MUSIC_DIR: &str = "iPod_Control/Music";
/// Number of `Fxx` fan-out folders
pub const MUSIC_DIR_COUNT: u32 = 20;

/// Translate a device path to a host path below `base`
pub fn to_host_path(base: &Path, ipod_path: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for component in ipod_path.split(':').filter(|c| !c.is_empty()) {
        path.push(component);
    }
    path
}

/// Device path for a track id, `:iPod_Control:Music:Fnn:<stem><id>`
pub fn track_path(track_id: u32, stem: &str) -> String {
    format!(
        ":iPod_Control:Music:F{:02}:{}{}",
        track_id % MUSIC_DIR_COUNT,
        stem,
        track_id
    )
}

pub fn escape_slashes(name: &str) -> String {
    name.replace('/', "%2f")
}

pub fn unescape_slashes(name: &str) -> String {
    name.replace("%2f", "/")
}
