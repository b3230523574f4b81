//! iTunesDB serialization
//!
//! Record lengths and child counts sit in front of the data they describe, so
//! every block is encoded body-first into its own buffer and the header is
//! built afterwards from the finished body. Nothing is patched in place.
//!
//! Output layout:
//! - mhbd
//!   - mhsd (tracks): mhlt, then mhit + mhod* per track
//!   - mhsd (playlists): mhlp, main playlist first, then mhyp + mhod + (mhip + mhod)* per playlist

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::block::{
    encode, DatabaseHeader, PlaylistHeader, PlaylistItemHeader, PlaylistListHeader,
    PositionPropertyBlock, SectionHeader, StringPropertyHeader, TrackListHeader,
    DATABASE_HEADER_LEN, LIST_HEADER_LEN, PLAYLIST_HEADER_LEN, PLAYLIST_ITEM_HEADER_LEN,
    POSITION_PROPERTY_LEN, PROPERTY_HEADER_LEN, SECTION_PLAYLISTS, SECTION_TRACKS,
};
use crate::error::{Error, Result};
use crate::listitem::{ItemProperty, MHOD_PLAYLIST_POSITION};
use crate::string::encode_ucs2;
use crate::track::Track;
use crate::tracklist::TrackList;

/// Shuffle database header and entry sizes
const SD_HEADER_LEN: usize = 0x12;
const SD_ENTRY_LEN: usize = 0x22E;
const SD_PATH_LEN: usize = 522;

/// Everything the writer needs from the in-memory database
pub trait ItunesDbDataSource {
    /// Called before anything is encoded
    fn write_init(&mut self) {}

    /// Called after the file has been written
    fn write_finished(&mut self) {}

    fn main_playlist(&self) -> Option<&TrackList>;

    /// Playlists other than the main playlist
    fn playlists(&self) -> Box<dyn Iterator<Item = &TrackList> + '_>;

    fn tracks(&self) -> Box<dyn Iterator<Item = Track> + '_>;

    fn num_tracks(&self) -> usize;

    fn num_playlists(&self) -> usize;
}

pub struct ItunesDbWriter;

impl ItunesDbWriter {
    /// Encode the whole database into memory
    pub fn encode<D: ItunesDbDataSource + ?Sized>(source: &D) -> Result<Vec<u8>> {
        let main = source
            .main_playlist()
            .ok_or_else(|| Error::Write("no main playlist".into()))?;

        let tracks = encode_track_section(source)?;
        let playlists = encode_playlist_section(source, main)?;

        let sections_len = tracks.len() + playlists.len();
        let header = DatabaseHeader::new(DATABASE_HEADER_LEN + sections_len as u32, 2);

        let mut output = Vec::with_capacity(DATABASE_HEADER_LEN as usize + sections_len);
        output.extend(encode(&header)?);
        output.extend(tracks);
        output.extend(playlists);
        Ok(output)
    }

    /// Encode and write to `path`, notifying the data source around it
    ///
    /// The file is overwritten directly; callers that need atomic replacement
    /// write to a temporary path and rename.
    pub fn write_file<D, P>(source: &mut D, path: P) -> Result<()>
    where
        D: ItunesDbDataSource + ?Sized,
        P: AsRef<Path>,
    {
        source.write_init();
        let data = Self::encode(source)?;
        fs::write(path.as_ref(), &data)?;
        info!(
            "Wrote iTunesDB {:?} ({} bytes, {} tracks, {} playlists)",
            path.as_ref(),
            data.len(),
            source.num_tracks(),
            source.num_playlists()
        );
        source.write_finished();
        Ok(())
    }

    /// Encode the shuffle database (`iTunesSD`) for the main playlist tracks
    pub fn encode_shuffle<D: ItunesDbDataSource + ?Sized>(source: &D) -> Result<Vec<u8>> {
        let main = source
            .main_playlist()
            .ok_or_else(|| Error::Write("no main playlist".into()))?;
        let tracks: Vec<Track> = source
            .tracks()
            .filter(|track| main.contains(track.id))
            .collect();

        let mut output = Vec::with_capacity(SD_HEADER_LEN + tracks.len() * SD_ENTRY_LEN);
        push_u24_be(&mut output, tracks.len() as u32);
        push_u24_be(&mut output, 0x010600);
        push_u24_be(&mut output, SD_HEADER_LEN as u32);
        output.extend_from_slice(&[0u8; 9]);

        for track in &tracks {
            output.extend(encode_shuffle_entry(track));
        }
        Ok(output)
    }
}

fn encode_track_section<D: ItunesDbDataSource + ?Sized>(source: &D) -> Result<Vec<u8>> {
    let mut body = encode(&TrackListHeader {
        header_len: LIST_HEADER_LEN,
        num_tracks: source.num_tracks() as u32,
    })?;
    for track in source.tracks() {
        body.extend(encode_track(&track)?);
    }
    debug!("track section: {} bytes", body.len());

    let mut section = encode(&SectionHeader::new(SECTION_TRACKS, body.len()))?;
    section.extend(body);
    Ok(section)
}

fn encode_track(track: &Track) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut num_mhods = 0u32;
    for (property, value) in track.properties.iter() {
        body.extend(encode_string_property(property, value)?);
        num_mhods += 1;
    }

    let total_len = track.layout.header_len() + body.len();
    let mut block = track.header_bytes(num_mhods, total_len as u32);
    block.extend(body);
    Ok(block)
}

fn encode_string_property(property: ItemProperty, value: &str) -> Result<Vec<u8>> {
    let payload = encode_ucs2(value);
    let mut block = encode(&StringPropertyHeader::new(property.mhod_type(), payload.len()))?;
    block.extend(payload);
    Ok(block)
}

fn encode_playlist_section<D: ItunesDbDataSource + ?Sized>(
    source: &D,
    main: &TrackList,
) -> Result<Vec<u8>> {
    let mut body = encode(&PlaylistListHeader {
        header_len: LIST_HEADER_LEN,
        num_playlists: source.num_playlists() as u32 + 1,
    })?;
    body.extend(encode_playlist(main, true)?);
    for playlist in source.playlists() {
        body.extend(encode_playlist(playlist, false)?);
    }
    debug!("playlist section: {} bytes", body.len());

    let mut section = encode(&SectionHeader::new(SECTION_PLAYLISTS, body.len()))?;
    section.extend(body);
    Ok(section)
}

fn encode_playlist(playlist: &TrackList, main: bool) -> Result<Vec<u8>> {
    let mut body = encode_string_property(ItemProperty::Title, playlist.title())?;

    let mut num_items = 0u32;
    for (index, track_id) in playlist.track_ids().enumerate() {
        body.extend(encode_playlist_item(index as u32, track_id, playlist.timestamp)?);
        num_items += 1;
    }

    let header = PlaylistHeader {
        header_len: PLAYLIST_HEADER_LEN,
        total_len: PLAYLIST_HEADER_LEN + body.len() as u32,
        num_mhods: 1,
        num_items,
        main_flag: main as u32,
        timestamp: playlist.timestamp,
        playlist_id: playlist.playlist_id,
        unknown1: 0,
        string_mhod_count: 1,
        podcast_flag: 0,
        sort_order: playlist.sort_order,
    };
    let mut block = encode(&header)?;
    block.extend(body);
    Ok(block)
}

fn encode_playlist_item(index: u32, track_id: u32, timestamp: u32) -> Result<Vec<u8>> {
    let position = encode(&PositionPropertyBlock {
        header_len: PROPERTY_HEADER_LEN,
        total_len: POSITION_PROPERTY_LEN,
        kind: MHOD_PLAYLIST_POSITION,
        unknown1: 0,
        unknown2: 0,
        position: index + 1,
    })?;
    let header = PlaylistItemHeader {
        header_len: PLAYLIST_ITEM_HEADER_LEN,
        total_len: PLAYLIST_ITEM_HEADER_LEN + position.len() as u32,
        num_mhods: 1,
        podcast_group_flag: 0,
        group_id: index,
        track_id,
        timestamp,
        podcast_group_ref: 0,
    };
    let mut block = encode(&header)?;
    block.extend(position);
    Ok(block)
}

fn encode_shuffle_entry(track: &Track) -> Vec<u8> {
    let mut entry = Vec::with_capacity(SD_ENTRY_LEN);
    push_u24_be(&mut entry, SD_ENTRY_LEN as u32);
    push_u24_be(&mut entry, 0x5AA501);
    push_u24_be(&mut entry, 0); // start time
    push_u24_be(&mut entry, 0);
    push_u24_be(&mut entry, 0);
    push_u24_be(&mut entry, 0); // stop time
    push_u24_be(&mut entry, 0);
    push_u24_be(&mut entry, 0);
    push_u24_be(&mut entry, 0x64); // volume: unchanged
    push_u24_be(&mut entry, track.file_kind().shuffle_code());
    push_u24_be(&mut entry, 0x000200);

    let mut path = encode_ucs2(&track.path().replace(':', "/"));
    path.resize(SD_PATH_LEN, 0);
    entry.extend(path);

    entry.push(1); // include in shuffle
    entry.push(0); // bookmarkable
    entry.push(0);
    entry
}

fn push_u24_be(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_be_bytes()[1..]);
}
