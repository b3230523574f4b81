//! iTunesDB block tags and fixed-layout headers
//!
//! Every block starts with a 4-byte ASCII tag followed by the header length.
//! The third word is either the total block length (header plus children) or,
//! for the list headers `mhlt`/`mhlp`, the number of children.
//!
//! Headers with a single layout are declared with binrw; the track header has
//! two layouts and is handled by [`crate::track::Track`].

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite, Endian};

use crate::error::Result;

pub type Tag = [u8; 4];

pub const MHBD: &Tag = b"mhbd";
pub const MHSD: &Tag = b"mhsd";
pub const MHLT: &Tag = b"mhlt";
pub const MHIT: &Tag = b"mhit";
pub const MHOD: &Tag = b"mhod";
pub const MHLP: &Tag = b"mhlp";
pub const MHYP: &Tag = b"mhyp";
pub const MHIP: &Tag = b"mhip";

pub const DATABASE_HEADER_LEN: u32 = 0x68;
pub const SECTION_HEADER_LEN: u32 = 0x60;
pub const LIST_HEADER_LEN: u32 = 0x5C;
pub const PLAYLIST_HEADER_LEN: u32 = 0x6C;
pub const PLAYLIST_ITEM_HEADER_LEN: u32 = 0x4C;
pub const PROPERTY_HEADER_LEN: u32 = 0x18;
/// Header plus the fixed string descriptor preceding the payload
pub const STRING_PROPERTY_PREFIX_LEN: u32 = 0x28;
pub const POSITION_PROPERTY_LEN: u32 = 0x2C;

/// Smallest block prefix: tag, header length, length-or-count
pub const BLOCK_PREFIX_LEN: usize = 12;

/// Database version written into `mhbd`
pub const DATABASE_VERSION: u32 = 0x0D;

/// `mhsd` section kinds
pub const SECTION_TRACKS: u32 = 1;
pub const SECTION_PLAYLISTS: u32 = 2;

/// Common block prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPrefix {
    pub tag: Tag,
    pub header_len: u32,
    /// Total block length, or the child count for list headers
    pub length_or_count: u32,
}

impl BlockPrefix {
    /// Read the 12-byte prefix at `offset`, `None` if it runs past the end
    pub fn read(data: &[u8], offset: usize) -> Option<Self> {
        let end = offset.checked_add(BLOCK_PREFIX_LEN)?;
        if end > data.len() {
            return None;
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&data[offset..offset + 4]);
        Some(Self {
            tag,
            header_len: le_u32(data, offset + 4),
            length_or_count: le_u32(data, offset + 8),
        })
    }
}

/// Printable form of a tag for diagnostics
pub fn tag_name(tag: &Tag) -> String {
    tag.iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect()
}

pub fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub fn le_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

pub fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn put_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Encode a binrw header into a fresh buffer
pub fn encode<T>(value: &T) -> Result<Vec<u8>>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(Vec::new());
    value.write_options(&mut cursor, Endian::Little, ())?;
    Ok(cursor.into_inner())
}

/// Decode a binrw header from the start of `data`
pub fn decode<T>(data: &[u8]) -> Result<T>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(data);
    Ok(T::read_options(&mut cursor, Endian::Little, ())?)
}

/// `mhbd` file header
#[binrw]
#[brw(little, magic = b"mhbd")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub header_len: u32,
    /// Length of the whole file
    pub total_len: u32,
    /// Always 1
    pub unknown1: u32,
    pub version: u32,
    /// Number of `mhsd` sections
    pub num_children: u32,
    #[brw(pad_after = 0x48)]
    pub db_id: u64,
}

impl DatabaseHeader {
    pub fn new(total_len: u32, num_children: u32) -> Self {
        Self {
            header_len: DATABASE_HEADER_LEN,
            total_len,
            unknown1: 1,
            version: DATABASE_VERSION,
            num_children,
            db_id: 0,
        }
    }
}

/// `mhsd` section divider
#[binrw]
#[brw(little, magic = b"mhsd")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub header_len: u32,
    pub total_len: u32,
    #[brw(pad_after = 0x50)]
    pub kind: u32,
}

impl SectionHeader {
    pub fn new(kind: u32, body_len: usize) -> Self {
        Self {
            header_len: SECTION_HEADER_LEN,
            total_len: SECTION_HEADER_LEN + body_len as u32,
            kind,
        }
    }
}

/// `mhlt` track list header
#[binrw]
#[brw(little, magic = b"mhlt")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackListHeader {
    pub header_len: u32,
    #[brw(pad_after = 0x50)]
    pub num_tracks: u32,
}

/// `mhlp` playlist list header
#[binrw]
#[brw(little, magic = b"mhlp")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistListHeader {
    pub header_len: u32,
    #[brw(pad_after = 0x50)]
    pub num_playlists: u32,
}

/// `mhyp` playlist header
#[binrw]
#[brw(little, magic = b"mhyp")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistHeader {
    pub header_len: u32,
    pub total_len: u32,
    pub num_mhods: u32,
    pub num_items: u32,
    /// 1 for the main (device) playlist
    pub main_flag: u32,
    pub timestamp: u32,
    pub playlist_id: u64,
    pub unknown1: u32,
    pub string_mhod_count: u16,
    pub podcast_flag: u16,
    #[brw(pad_after = 0x3C)]
    pub sort_order: u32,
}

/// `mhip` playlist item header
#[binrw]
#[brw(little, magic = b"mhip")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistItemHeader {
    pub header_len: u32,
    pub total_len: u32,
    pub num_mhods: u32,
    pub podcast_group_flag: u32,
    pub group_id: u32,
    pub track_id: u32,
    pub timestamp: u32,
    #[brw(pad_after = 0x28)]
    pub podcast_group_ref: u32,
}

/// String `mhod` header up to the payload
#[binrw]
#[brw(little, magic = b"mhod")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringPropertyHeader {
    pub header_len: u32,
    pub total_len: u32,
    pub kind: u32,
    pub unknown1: u32,
    pub unknown2: u32,
    pub position: u32,
    pub byte_len: u32,
    /// 1 = UTF-16
    pub encoding: u32,
    pub unknown3: u32,
}

impl StringPropertyHeader {
    pub fn new(kind: u32, byte_len: usize) -> Self {
        Self {
            header_len: PROPERTY_HEADER_LEN,
            total_len: STRING_PROPERTY_PREFIX_LEN + byte_len as u32,
            kind,
            unknown1: 0,
            unknown2: 0,
            position: 1,
            byte_len: byte_len as u32,
            encoding: 1,
            unknown3: 0,
        }
    }
}

/// Type-100 `mhod` carrying an item position inside a playlist
#[binrw]
#[brw(little, magic = b"mhod")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionPropertyBlock {
    pub header_len: u32,
    pub total_len: u32,
    pub kind: u32,
    pub unknown1: u32,
    pub unknown2: u32,
    #[brw(pad_after = 0x10)]
    pub position: u32,
}
