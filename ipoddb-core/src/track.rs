//! Track records
//!
//! A track is a property bag (title, artist, album, path, ...) plus the fixed
//! numeric fields of the `mhit` header. Two header layouts exist in the wild:
//!
//! - 156 bytes (0x9C): iTunes 4.7 era
//! - 244 bytes (0xF4): iTunes 4.9 era, adds a second 64-bit id at 0xA0
//!
//! The layout read from disk is kept so a rewritten database matches what the
//! device expects.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::block::{le_u16, le_u32, le_u64, put_u16, put_u32, put_u64, MHIT};
use crate::error::{Error, Result};
use crate::listitem::{ItemProperty, ListItem};

/// Seconds between 1904-01-01 (Mac epoch) and 1970-01-01
pub const MAC_EPOCH_OFFSET: u64 = 2_082_844_800;

pub const NO_ARTIST: &str = "_no_artist_";
pub const NO_ALBUM: &str = "_no_album_";
pub const NO_TITLE: &str = "_no_title_";

/// Byte offset of the second database id in the long layout
const DBID2_OFFSET: usize = 0xA0;

/// Current time as a Mac-epoch timestamp
pub fn mac_timestamp_now() -> u32 {
    mac_timestamp(SystemTime::now())
}

pub fn mac_timestamp(time: SystemTime) -> u32 {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (unix + MAC_EPOCH_OFFSET) as u32
}

/// Convert a Mac-epoch timestamp to Unix seconds (0 stays 0)
pub fn unix_from_mac(mac: u32) -> u64 {
    (mac as u64).saturating_sub(MAC_EPOCH_OFFSET)
}

/// `mhit` header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HeaderLayout {
    /// 156-byte header
    Itunes47,
    /// 244-byte header
    #[default]
    Itunes49,
}

impl HeaderLayout {
    pub fn header_len(self) -> usize {
        match self {
            HeaderLayout::Itunes47 => 0x9C,
            HeaderLayout::Itunes49 => 0xF4,
        }
    }

    /// Pick the layout for a declared header length, `None` if too short
    pub fn from_header_len(len: usize) -> Option<Self> {
        if len < 0x9C {
            None
        } else if len < DBID2_OFFSET + 8 {
            Some(HeaderLayout::Itunes47)
        } else {
            Some(HeaderLayout::Itunes49)
        }
    }
}

/// Audio container kind, derived from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FileKind {
    #[default]
    Unknown,
    Mp3,
    Aac,
    Wav,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "mp3" => FileKind::Mp3,
            "m4a" | "m4p" | "m4b" | "aac" => FileKind::Aac,
            "wav" => FileKind::Wav,
            _ => FileKind::Unknown,
        }
    }

    /// Four-character code stored in the `mhit` header
    pub fn fourcc(self) -> u32 {
        match self {
            FileKind::Mp3 => u32::from_be_bytes(*b"MP3 "),
            FileKind::Aac => u32::from_be_bytes(*b"M4A "),
            FileKind::Wav => u32::from_be_bytes(*b"WAV "),
            FileKind::Unknown => 0,
        }
    }

    /// File type code used by the shuffle database
    pub fn shuffle_code(self) -> u32 {
        match self {
            FileKind::Mp3 | FileKind::Unknown => 1,
            FileKind::Aac => 2,
            FileKind::Wav => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Unique within a database, 0 means "not initialized"
    pub id: u32,
    pub properties: ListItem,
    pub layout: HeaderLayout,
    pub visible: u32,
    pub file_type: u32,
    pub vbr: bool,
    pub type2: u8,
    pub compilation: bool,
    /// 0-100, stars * 20
    pub rating: u8,
    pub last_modified: u32,
    pub file_size: u32,
    pub length_ms: u32,
    pub track_number: u32,
    pub num_tracks: u32,
    pub year: u32,
    pub bitrate: u32,
    /// Hz
    pub sample_rate: u32,
    pub volume: i32,
    pub start_time_ms: u32,
    pub stop_time_ms: u32,
    pub sound_check: u32,
    pub play_count: u32,
    pub last_played: u32,
    pub disc_number: u32,
    pub num_discs: u32,
    pub user_id: u32,
    pub date_added: u32,
    pub bookmark_time_ms: u32,
    pub dbid: u64,
    pub checked: u8,
    pub app_rating: u8,
    pub bpm: u16,
    pub artwork_count: u16,
    pub artwork_size: u32,
    pub date_released: u32,
    /// Only stored by the 244-byte layout
    pub dbid2: u64,
}

impl Default for Track {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Track {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            properties: ListItem::new(),
            layout: HeaderLayout::default(),
            visible: 1,
            file_type: 0,
            vbr: false,
            type2: 0,
            compilation: false,
            rating: 0,
            last_modified: 0,
            file_size: 0,
            length_ms: 0,
            track_number: 0,
            num_tracks: 0,
            year: 0,
            bitrate: 0,
            sample_rate: 0,
            volume: 0,
            start_time_ms: 0,
            stop_time_ms: 0,
            sound_check: 0,
            play_count: 0,
            last_played: 0,
            disc_number: 0,
            num_discs: 0,
            user_id: 0,
            date_added: 0,
            bookmark_time_ms: 0,
            dbid: 0,
            checked: 0,
            app_rating: 0,
            bpm: 0,
            artwork_count: 0,
            artwork_size: 0,
            date_released: 0,
            dbid2: 0,
        }
    }

    pub fn title(&self) -> &str {
        self.properties.get(ItemProperty::Title)
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.properties.set(ItemProperty::Title, title);
    }

    pub fn artist(&self) -> &str {
        self.properties.get(ItemProperty::Artist)
    }

    pub fn set_artist(&mut self, artist: impl Into<String>) {
        self.properties.set(ItemProperty::Artist, artist);
    }

    pub fn album(&self) -> &str {
        self.properties.get(ItemProperty::Album)
    }

    pub fn set_album(&mut self, album: impl Into<String>) {
        self.properties.set(ItemProperty::Album, album);
    }

    pub fn genre(&self) -> &str {
        self.properties.get(ItemProperty::Genre)
    }

    pub fn set_genre(&mut self, genre: impl Into<String>) {
        self.properties.set(ItemProperty::Genre, genre);
    }

    pub fn composer(&self) -> &str {
        self.properties.get(ItemProperty::Composer)
    }

    pub fn set_composer(&mut self, composer: impl Into<String>) {
        self.properties.set(ItemProperty::Composer, composer);
    }

    pub fn comment(&self) -> &str {
        self.properties.get(ItemProperty::Comment)
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.properties.set(ItemProperty::Comment, comment);
    }

    /// Device path in `:` notation
    pub fn path(&self) -> &str {
        self.properties.get(ItemProperty::Path)
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.properties.set(ItemProperty::Path, path);
    }

    /// Store a string property from a parsed `mhod`
    pub fn set_string_property(&mut self, property: ItemProperty, value: String) {
        self.properties.set(property, value);
    }

    pub fn stars(&self) -> u8 {
        self.rating / 20
    }

    pub fn set_stars(&mut self, stars: u8) {
        self.rating = stars.min(5) * 20;
    }

    /// Container kind derived from the device path extension
    pub fn file_kind(&self) -> FileKind {
        let path = self.path().replace(':', "/");
        Path::new(&path)
            .extension()
            .map(|ext| FileKind::from_extension(&ext.to_string_lossy()))
            .unwrap_or_default()
    }

    /// Finalize hook: artist, album and title never serialize empty
    pub fn done_adding_data(&mut self) {
        if self.artist().is_empty() {
            self.set_artist(NO_ARTIST);
        }
        if self.album().is_empty() {
            self.set_album(NO_ALBUM);
        }
        if self.title().is_empty() {
            self.set_title(NO_TITLE);
        }
        if self.file_type == 0 {
            self.file_type = self.file_kind().fourcc();
        }
    }

    /// Read the fixed fields from a complete `mhit` header
    pub fn from_header(header: &[u8]) -> Result<Self> {
        let layout = HeaderLayout::from_header_len(header.len()).ok_or_else(|| {
            Error::Parse(format!("mhit header too short: {} bytes", header.len()))
        })?;
        if &header[0..4] != MHIT {
            return Err(Error::Parse("mhit header without mhit tag".into()));
        }

        let mut track = Track::new(le_u32(header, 0x10));
        track.layout = layout;
        track.visible = le_u32(header, 0x14);
        track.file_type = le_u32(header, 0x18);
        track.vbr = header[0x1C] != 0;
        track.type2 = header[0x1D];
        track.compilation = header[0x1E] != 0;
        track.rating = header[0x1F];
        track.last_modified = le_u32(header, 0x20);
        track.file_size = le_u32(header, 0x24);
        track.length_ms = le_u32(header, 0x28);
        track.track_number = le_u32(header, 0x2C);
        track.num_tracks = le_u32(header, 0x30);
        track.year = le_u32(header, 0x34);
        track.bitrate = le_u32(header, 0x38);
        track.sample_rate = le_u32(header, 0x3C) >> 16;
        track.volume = le_u32(header, 0x40) as i32;
        track.start_time_ms = le_u32(header, 0x44);
        track.stop_time_ms = le_u32(header, 0x48);
        track.sound_check = le_u32(header, 0x4C);
        track.play_count = le_u32(header, 0x50);
        track.last_played = le_u32(header, 0x58);
        track.disc_number = le_u32(header, 0x5C);
        track.num_discs = le_u32(header, 0x60);
        track.user_id = le_u32(header, 0x64);
        track.date_added = le_u32(header, 0x68);
        track.bookmark_time_ms = le_u32(header, 0x6C);
        track.dbid = le_u64(header, 0x70);
        track.checked = header[0x78];
        track.app_rating = header[0x79];
        track.bpm = le_u16(header, 0x7A);
        track.artwork_count = le_u16(header, 0x7C);
        track.artwork_size = le_u32(header, 0x80);
        track.date_released = le_u32(header, 0x88);
        if layout == HeaderLayout::Itunes49 {
            track.dbid2 = le_u64(header, DBID2_OFFSET);
        }
        Ok(track)
    }

    /// Encode the fixed header once the child count and block length are known
    pub fn header_bytes(&self, num_mhods: u32, total_len: u32) -> Vec<u8> {
        let header_len = self.layout.header_len();
        let mut data = vec![0u8; header_len];

        data[0..4].copy_from_slice(MHIT);
        put_u32(&mut data, 0x04, header_len as u32);
        put_u32(&mut data, 0x08, total_len);
        put_u32(&mut data, 0x0C, num_mhods);
        put_u32(&mut data, 0x10, self.id);
        put_u32(&mut data, 0x14, self.visible);
        put_u32(&mut data, 0x18, self.file_type);
        data[0x1C] = self.vbr as u8;
        data[0x1D] = self.type2;
        data[0x1E] = self.compilation as u8;
        data[0x1F] = self.rating;
        put_u32(&mut data, 0x20, self.last_modified);
        put_u32(&mut data, 0x24, self.file_size);
        put_u32(&mut data, 0x28, self.length_ms);
        put_u32(&mut data, 0x2C, self.track_number);
        put_u32(&mut data, 0x30, self.num_tracks);
        put_u32(&mut data, 0x34, self.year);
        put_u32(&mut data, 0x38, self.bitrate);
        put_u32(&mut data, 0x3C, self.sample_rate << 16);
        put_u32(&mut data, 0x40, self.volume as u32);
        put_u32(&mut data, 0x44, self.start_time_ms);
        put_u32(&mut data, 0x48, self.stop_time_ms);
        put_u32(&mut data, 0x4C, self.sound_check);
        put_u32(&mut data, 0x50, self.play_count);
        // second play counter mirrors the first
        put_u32(&mut data, 0x54, self.play_count);
        put_u32(&mut data, 0x58, self.last_played);
        put_u32(&mut data, 0x5C, self.disc_number);
        put_u32(&mut data, 0x60, self.num_discs);
        put_u32(&mut data, 0x64, self.user_id);
        put_u32(&mut data, 0x68, self.date_added);
        put_u32(&mut data, 0x6C, self.bookmark_time_ms);
        put_u64(&mut data, 0x70, self.dbid);
        data[0x78] = self.checked;
        data[0x79] = self.app_rating;
        put_u16(&mut data, 0x7A, self.bpm);
        put_u16(&mut data, 0x7C, self.artwork_count);
        put_u32(&mut data, 0x80, self.artwork_size);
        put_u32(&mut data, 0x88, self.date_released);
        if self.layout == HeaderLayout::Itunes49 {
            put_u64(&mut data, DBID2_OFFSET, self.dbid2);
        }
        data
    }

    /// Parameters of an add-track log entry
    pub fn to_log_entry(&self) -> Result<Vec<String>> {
        Ok(vec![serde_json::to_string(self)?])
    }

    pub fn from_log_entry(values: &[String]) -> Option<Self> {
        let track: Track = serde_json::from_str(values.first()?).ok()?;
        (track.id != 0).then_some(track)
    }
}
