//! Write-ahead action log
//!
//! Every mutation made through [`crate::ipod::IPod`] is appended here before
//! the database is rewritten. Other sessions on the same device replay the
//! entries they have not seen yet. The log is only valid for the database
//! version it was started against, so the file name carries the database
//! modification time.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! action u32 | payload_len u32 | payload
//! payload = (byte_len u32 | UTF-16LE bytes)*
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use binrw::binrw;
use tracing::{debug, warn};

use crate::block::{decode, encode, le_u32};
use crate::error::{Error, Result};
use crate::string::{decode_ucs2, encode_ucs2};
use crate::track::Track;

/// Directory holding the log, relative to the mount point
pub const LOG_DIR: &str = "iPod_Control/iTunes";
pub const LOG_FILE_PREFIX: &str = ".ipoddb_log_";

const FRAME_HEADER_LEN: usize = 8;

/// Log file path for a database with the given modification time
pub fn log_file_path(base: &Path, db_mtime: SystemTime) -> PathBuf {
    let secs = db_mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    base.join(LOG_DIR).join(format!("{}{}", LOG_FILE_PREFIX, secs))
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogActionType {
    AddPlaylist = 0,
    RemovePlaylist = 1,
    RenamePlaylist = 2,
    AddToPlaylist = 3,
    RemoveFromPlaylist = 4,
    AddTrack = 5,
    RemoveTrack = 6,
    MoveTrack = 7,
    RenameAlbum = 8,
    RemoveAlbum = 9,
    DeleteArtist = 10,
}

impl LogActionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::AddPlaylist,
            1 => Self::RemovePlaylist,
            2 => Self::RenamePlaylist,
            3 => Self::AddToPlaylist,
            4 => Self::RemoveFromPlaylist,
            5 => Self::AddTrack,
            6 => Self::RemoveTrack,
            7 => Self::MoveTrack,
            8 => Self::RenameAlbum,
            9 => Self::RemoveAlbum,
            10 => Self::DeleteArtist,
            _ => return None,
        })
    }
}

/// One logged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAction {
    AddPlaylist { title: String },
    RemovePlaylist { title: String },
    RenamePlaylist { title: String, new_title: String },
    AddToPlaylist { title: String, track_id: u32 },
    /// 0-based position
    RemoveFromPlaylist { title: String, position: u32 },
    AddTrack { track: Box<Track> },
    RemoveTrack { track_id: u32 },
    MoveTrack { track_id: u32, artist: String, album: String },
    RenameAlbum { artist: String, album: String, new_artist: String, new_album: String },
    RemoveAlbum { artist: String, album: String },
    DeleteArtist { artist: String },
}

impl LogAction {
    pub fn action_type(&self) -> LogActionType {
        match self {
            LogAction::AddPlaylist { .. } => LogActionType::AddPlaylist,
            LogAction::RemovePlaylist { .. } => LogActionType::RemovePlaylist,
            LogAction::RenamePlaylist { .. } => LogActionType::RenamePlaylist,
            LogAction::AddToPlaylist { .. } => LogActionType::AddToPlaylist,
            LogAction::RemoveFromPlaylist { .. } => LogActionType::RemoveFromPlaylist,
            LogAction::AddTrack { .. } => LogActionType::AddTrack,
            LogAction::RemoveTrack { .. } => LogActionType::RemoveTrack,
            LogAction::MoveTrack { .. } => LogActionType::MoveTrack,
            LogAction::RenameAlbum { .. } => LogActionType::RenameAlbum,
            LogAction::RemoveAlbum { .. } => LogActionType::RemoveAlbum,
            LogAction::DeleteArtist { .. } => LogActionType::DeleteArtist,
        }
    }

    /// String parameters as stored in a frame
    pub fn to_values(&self) -> Result<Vec<String>> {
        Ok(match self {
            LogAction::AddPlaylist { title } | LogAction::RemovePlaylist { title } => {
                vec![title.clone()]
            }
            LogAction::RenamePlaylist { title, new_title } => {
                vec![title.clone(), new_title.clone()]
            }
            LogAction::AddToPlaylist { title, track_id } => {
                vec![title.clone(), track_id.to_string()]
            }
            LogAction::RemoveFromPlaylist { title, position } => {
                vec![title.clone(), position.to_string()]
            }
            LogAction::AddTrack { track } => track.to_log_entry()?,
            LogAction::RemoveTrack { track_id } => vec![track_id.to_string()],
            LogAction::MoveTrack { track_id, artist, album } => {
                vec![track_id.to_string(), artist.clone(), album.clone()]
            }
            LogAction::RenameAlbum { artist, album, new_artist, new_album } => vec![
                artist.clone(),
                album.clone(),
                new_artist.clone(),
                new_album.clone(),
            ],
            LogAction::RemoveAlbum { artist, album } => vec![artist.clone(), album.clone()],
            LogAction::DeleteArtist { artist } => vec![artist.clone()],
        })
    }

    /// Rebuild an action, `None` when parameters are missing or malformed
    pub fn from_values(kind: LogActionType, values: &[String]) -> Option<Self> {
        let text = |i: usize| values.get(i).cloned();
        let number = |i: usize| values.get(i).and_then(|v| v.parse::<u32>().ok());

        Some(match kind {
            LogActionType::AddPlaylist => LogAction::AddPlaylist { title: text(0)? },
            LogActionType::RemovePlaylist => LogAction::RemovePlaylist { title: text(0)? },
            LogActionType::RenamePlaylist => LogAction::RenamePlaylist {
                title: text(0)?,
                new_title: text(1)?,
            },
            LogActionType::AddToPlaylist => LogAction::AddToPlaylist {
                title: text(0)?,
                track_id: number(1)?,
            },
            LogActionType::RemoveFromPlaylist => LogAction::RemoveFromPlaylist {
                title: text(0)?,
                position: number(1)?,
            },
            LogActionType::AddTrack => LogAction::AddTrack {
                track: Box::new(Track::from_log_entry(values)?),
            },
            LogActionType::RemoveTrack => LogAction::RemoveTrack { track_id: number(0)? },
            LogActionType::MoveTrack => LogAction::MoveTrack {
                track_id: number(0)?,
                artist: text(1)?,
                album: text(2)?,
            },
            LogActionType::RenameAlbum => LogAction::RenameAlbum {
                artist: text(0)?,
                album: text(1)?,
                new_artist: text(2)?,
                new_album: text(3)?,
            },
            LogActionType::RemoveAlbum => LogAction::RemoveAlbum {
                artist: text(0)?,
                album: text(1)?,
            },
            LogActionType::DeleteArtist => LogAction::DeleteArtist { artist: text(0)? },
        })
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    action: u32,
    payload_len: u32,
}

/// A decoded frame before its action is interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub action: u32,
    pub values: Vec<String>,
}

impl LogFrame {
    /// `None` for unknown action tags and unusable parameters
    pub fn to_action(&self) -> Option<LogAction> {
        LogAction::from_values(LogActionType::from_u32(self.action)?, &self.values)
    }
}

pub fn encode_frame(action: &LogAction) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for value in action.to_values()? {
        let bytes = encode_ucs2(&value);
        payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        payload.extend(bytes);
    }
    let mut frame = encode(&FrameHeader {
        action: action.action_type() as u32,
        payload_len: payload.len() as u32,
    })?;
    frame.extend(payload);
    Ok(frame)
}

fn decode_values(payload: &[u8]) -> Vec<String> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos + 4 <= payload.len() {
        let len = le_u32(payload, pos) as usize;
        pos += 4;
        let Some(bytes) = payload.get(pos..pos.saturating_add(len)) else {
            warn!("log entry string runs past its frame");
            break;
        };
        values.push(decode_ucs2(bytes));
        pos += len;
    }
    values
}

/// Decode every complete frame, a partial trailing frame is dropped
pub fn decode_frames(data: &[u8]) -> Vec<LogFrame> {
    decode_complete_frames(data).0
}

/// Complete frames and the number of bytes they cover
fn decode_complete_frames(data: &[u8]) -> (Vec<LogFrame>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + FRAME_HEADER_LEN <= data.len() {
        let Ok(header) = decode::<FrameHeader>(&data[pos..]) else {
            break;
        };
        let start = pos + FRAME_HEADER_LEN;
        let Some(payload) = data.get(start..start.saturating_add(header.payload_len as usize))
        else {
            debug!("incomplete log frame at offset {}", pos);
            break;
        };
        frames.push(LogFrame {
            action: header.action,
            values: decode_values(payload),
        });
        pos = start + payload.len();
    }
    (frames, pos)
}

/// Where a session stands relative to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Database modification time the session was opened against
    pub mtime: Option<SystemTime>,
    /// Number of log frames already applied
    pub cursor: usize,
}

/// An encoded entry with its log file open for appending
#[derive(Debug)]
pub struct PreparedEntry {
    file: File,
    frame: Vec<u8>,
    kind: LogActionType,
}

/// Append-only log file with a replay cursor
#[derive(Debug)]
pub struct ActionLog {
    path: PathBuf,
    cursor: usize,
}

impl ActionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, cursor: 0 }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn append(&mut self, action: &LogAction) -> Result<()> {
        let entry = self.prepare(action)?;
        self.commit(entry)
    }

    /// Encode an entry and open the file for it without writing anything
    ///
    /// Fails with [`Error::Log`] when the file ends in a partial frame, since
    /// anything appended after it would be misread. The cursor must already
    /// cover every frame in the file.
    pub fn prepare(&self, action: &LogAction) -> Result<PreparedEntry> {
        let frame = encode_frame(action)?;
        match fs::read(&self.path) {
            Ok(data) => {
                let (_, complete) = decode_complete_frames(&data);
                if complete != data.len() {
                    return Err(Error::Log(format!(
                        "{:?} ends in a partial entry at offset {}",
                        self.path, complete
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(PreparedEntry {
            file,
            frame,
            kind: action.action_type(),
        })
    }

    /// Write a prepared entry and count it
    pub fn commit(&mut self, mut entry: PreparedEntry) -> Result<()> {
        entry.file.write_all(&entry.frame)?;
        entry.file.flush()?;
        self.cursor += 1;
        debug!("logged {:?} ({} entries)", entry.kind, self.cursor);
        Ok(())
    }

    /// Frames past the cursor, advancing the cursor over them
    ///
    /// Unknown or malformed frames are skipped but still counted.
    pub fn read_pending(&mut self) -> Result<Vec<LogAction>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let frames = decode_frames(&data);
        if self.cursor > frames.len() {
            warn!(
                "log {:?} has {} entries, cursor was {}",
                self.path,
                frames.len(),
                self.cursor
            );
            self.cursor = frames.len();
        }

        let mut actions = Vec::new();
        for frame in &frames[self.cursor..] {
            match frame.to_action() {
                Some(action) => actions.push(action),
                None => warn!("skipping log entry with action {}", frame.action),
            }
        }
        self.cursor = frames.len();
        Ok(actions)
    }

    /// Delete the log file and reset the cursor
    pub fn flush(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cursor = 0;
        Ok(())
    }
}
