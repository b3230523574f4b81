//! Streaming iTunesDB reader
//!
//! The file is a flat sequence of tagged blocks. Records are never closed
//! explicitly: a track ends where the next `mhit` (or section, or the end of
//! the file) begins, so the parser keeps one record in progress and finalizes
//! it when the next record starts.
//!
//! Results and errors are delivered to an [`ItunesDbListener`]. An unknown tag
//! or a bad file header is fatal; a block that runs past the end of the data is
//! treated as the end of the stream.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::block::{
    decode, le_u32, tag_name, BlockPrefix, PlaylistHeader, PlaylistItemHeader,
    StringPropertyHeader, BLOCK_PREFIX_LEN, MHBD, MHIP, MHIT, MHLP, MHLT, MHOD, MHSD, MHYP,
    SECTION_PLAYLISTS, SECTION_TRACKS,
};
use crate::error::Result;
use crate::listitem::ItemProperty;
use crate::string::decode_ucs2;
use crate::track::Track;
use crate::tracklist::TrackList;

/// Receiver of parsed records
pub trait ItunesDbListener {
    fn parse_started(&mut self) {}

    /// Called once after the last record, not called when the parse aborts
    fn parse_finished(&mut self) {}

    fn set_num_tracks(&mut self, _num_tracks: u32) {}

    fn set_num_playlists(&mut self, _num_playlists: u32) {}

    fn handle_track(&mut self, track: Track);

    /// Playlists arrive in file order, the first one is the device playlist
    fn handle_playlist(&mut self, playlist: TrackList);

    fn handle_error(&mut self, message: &str);
}

/// What a parse run saw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub tracks: usize,
    pub playlists: usize,
    /// The data ended inside a block
    pub truncated: bool,
    /// A fatal error was reported
    pub aborted: bool,
}

#[derive(Debug)]
struct PlaylistItem {
    track_id: u32,
}

/// The record currently being filled by `mhod` blocks
#[derive(Debug)]
enum Record {
    Track(Track),
    Playlist(TrackList),
    PlaylistItem(PlaylistItem),
}

impl Record {
    fn set_string_property(&mut self, property: ItemProperty, value: String) {
        match self {
            Record::Track(track) => track.set_string_property(property, value),
            Record::Playlist(playlist) => {
                if property == ItemProperty::Title {
                    playlist.set_title(value);
                }
            }
            Record::PlaylistItem(_) => {}
        }
    }

    fn done_adding_data(&mut self) {
        match self {
            Record::Track(track) => track.done_adding_data(),
            Record::Playlist(playlist) => playlist.set_changed(false),
            Record::PlaylistItem(_) => {}
        }
    }
}

pub struct ItunesDbParser<'a, L: ItunesDbListener> {
    listener: &'a mut L,
    current: Option<Record>,
    /// Playlist whose items are still being read
    open_playlist: Option<TrackList>,
    summary: ParseSummary,
}

impl<'a, L: ItunesDbListener> ItunesDbParser<'a, L> {
    pub fn new(listener: &'a mut L) -> Self {
        Self {
            listener,
            current: None,
            open_playlist: None,
            summary: ParseSummary::default(),
        }
    }

    /// Read a database file and parse it
    pub fn parse_file<P: AsRef<Path>>(self, path: P) -> Result<ParseSummary> {
        let data = fs::read(path)?;
        Ok(self.parse(&data))
    }

    /// Parse a complete database image
    pub fn parse(mut self, data: &[u8]) -> ParseSummary {
        self.listener.parse_started();

        let Some(file_header) = BlockPrefix::read(data, 0) else {
            return self.abort(format!("file too short for an iTunesDB header: {} bytes", data.len()));
        };
        if &file_header.tag != MHBD {
            return self.abort(format!(
                "not an iTunesDB file: expected 'mhbd', found '{}'",
                tag_name(&file_header.tag)
            ));
        }
        if (file_header.header_len as usize) < BLOCK_PREFIX_LEN {
            return self.abort(format!("invalid mhbd header length {}", file_header.header_len));
        }
        if file_header.length_or_count as usize != data.len() {
            warn!(
                "mhbd declares {} bytes, file has {}",
                file_header.length_or_count,
                data.len()
            );
        }

        let mut pos = file_header.header_len as usize;
        while pos < data.len() {
            let Some(block) = BlockPrefix::read(data, pos) else {
                self.truncated(pos);
                break;
            };
            let header_len = block.header_len as usize;
            if header_len < BLOCK_PREFIX_LEN || pos + header_len > data.len() {
                self.truncated(pos);
                break;
            }
            let header = &data[pos..pos + header_len];

            match &block.tag {
                tag if tag == MHSD => {
                    self.finish_record();
                    self.flush_playlist();
                    let kind = if header_len >= 16 { le_u32(header, 0x0C) } else { 0 };
                    if kind == SECTION_TRACKS || kind == SECTION_PLAYLISTS {
                        pos += header_len;
                    } else {
                        // podcast and album sections duplicate data we already read
                        debug!("skipping mhsd section of kind {}", kind);
                        pos += (block.length_or_count as usize).max(header_len);
                    }
                }
                tag if tag == MHLT => {
                    self.listener.set_num_tracks(block.length_or_count);
                    pos += header_len;
                }
                tag if tag == MHLP => {
                    self.listener.set_num_playlists(block.length_or_count);
                    pos += header_len;
                }
                tag if tag == MHIT => {
                    self.finish_record();
                    match Track::from_header(header) {
                        Ok(track) => self.current = Some(Record::Track(track)),
                        Err(e) => return self.abort(format!("at offset {:#x}: {}", pos, e)),
                    }
                    pos += header_len;
                }
                tag if tag == MHOD => {
                    let total_len = block.length_or_count as usize;
                    if total_len < header_len || pos + total_len > data.len() {
                        self.truncated(pos);
                        break;
                    }
                    self.handle_property(&data[pos..pos + total_len]);
                    pos += total_len;
                }
                tag if tag == MHYP => {
                    self.finish_record();
                    self.flush_playlist();
                    let Ok(playlist_header) = decode::<PlaylistHeader>(&data[pos..]) else {
                        self.truncated(pos);
                        break;
                    };
                    let mut playlist = TrackList::default();
                    playlist.main = playlist_header.main_flag != 0;
                    playlist.playlist_id = playlist_header.playlist_id;
                    playlist.timestamp = playlist_header.timestamp;
                    playlist.sort_order = playlist_header.sort_order;
                    self.current = Some(Record::Playlist(playlist));
                    pos += header_len;
                }
                tag if tag == MHIP => {
                    self.finish_record();
                    let Ok(item_header) = decode::<PlaylistItemHeader>(&data[pos..]) else {
                        self.truncated(pos);
                        break;
                    };
                    self.current = Some(Record::PlaylistItem(PlaylistItem {
                        track_id: item_header.track_id,
                    }));
                    pos += header_len;
                }
                tag => {
                    return self.abort(format!(
                        "unknown tag '{}' at offset {:#x}",
                        tag_name(tag),
                        pos
                    ));
                }
            }
        }

        self.finish_record();
        self.flush_playlist();
        self.listener.parse_finished();
        self.summary
    }

    fn handle_property(&mut self, block: &[u8]) {
        if block.len() < 16 {
            return;
        }
        let kind = le_u32(block, 0x0C);
        let Some(property) = ItemProperty::from_mhod_type(kind) else {
            debug!("ignoring mhod of type {}", kind);
            return;
        };
        let Some(record) = self.current.as_mut() else {
            debug!("mhod of type {} outside of a record", kind);
            return;
        };
        let Ok(header) = decode::<StringPropertyHeader>(block) else {
            warn!("mhod of type {} too short for a string", kind);
            return;
        };

        let start = (header.header_len as usize + 16).min(block.len());
        let end = start.saturating_add(header.byte_len as usize).min(block.len());
        record.set_string_property(property, decode_ucs2(&block[start..end]));
    }

    /// Finalize the in-progress record and hand it over
    fn finish_record(&mut self) {
        let Some(mut record) = self.current.take() else {
            return;
        };
        record.done_adding_data();

        match record {
            Record::Track(track) => {
                self.summary.tracks += 1;
                self.listener.handle_track(track);
            }
            Record::Playlist(playlist) => {
                self.flush_playlist();
                self.open_playlist = Some(playlist);
            }
            Record::PlaylistItem(item) => match self.open_playlist.as_mut() {
                Some(playlist) => {
                    playlist.add_playlist_item(item.track_id);
                }
                None => warn!("playlist item for track {} outside of a playlist", item.track_id),
            },
        }
    }

    fn flush_playlist(&mut self) {
        if let Some(mut playlist) = self.open_playlist.take() {
            playlist.set_changed(false);
            self.summary.playlists += 1;
            self.listener.handle_playlist(playlist);
        }
    }

    fn truncated(&mut self, pos: usize) {
        warn!("iTunesDB truncated at offset {:#x}", pos);
        self.summary.truncated = true;
    }

    fn abort(mut self, message: String) -> ParseSummary {
        self.listener.handle_error(&message);
        self.summary.aborted = true;
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{
        encode, DatabaseHeader, PlaylistListHeader, PositionPropertyBlock, SectionHeader,
        StringPropertyHeader, TrackListHeader, LIST_HEADER_LEN, PLAYLIST_HEADER_LEN,
        PLAYLIST_ITEM_HEADER_LEN, POSITION_PROPERTY_LEN, PROPERTY_HEADER_LEN,
    };
    use crate::string::encode_ucs2;
    use crate::track::{HeaderLayout, NO_ALBUM};

    #[derive(Default)]
    struct Collector {
        tracks: Vec<Track>,
        playlists: Vec<TrackList>,
        errors: Vec<String>,
        finished: bool,
    }

    impl ItunesDbListener for Collector {
        fn parse_finished(&mut self) {
            self.finished = true;
        }

        fn handle_track(&mut self, track: Track) {
            self.tracks.push(track);
        }

        fn handle_playlist(&mut self, playlist: TrackList) {
            self.playlists.push(playlist);
        }

        fn handle_error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
    }

    fn string_mhod(kind: u32, value: &str) -> Vec<u8> {
        let payload = encode_ucs2(value);
        let mut block = encode(&StringPropertyHeader::new(kind, payload.len())).unwrap();
        block.extend_from_slice(&payload);
        block
    }

    fn position_mhod(position: u32) -> Vec<u8> {
        encode(&PositionPropertyBlock {
            header_len: PROPERTY_HEADER_LEN,
            total_len: POSITION_PROPERTY_LEN,
            kind: 100,
            unknown1: 0,
            unknown2: 0,
            position,
        })
        .unwrap()
    }

    fn track_block(track: &Track, mhods: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = mhods.concat();
        let total = track.layout.header_len() + body.len();
        let mut block = track.header_bytes(mhods.len() as u32, total as u32);
        block.extend_from_slice(&body);
        block
    }

    fn playlist_block(title: &str, main: bool, track_ids: &[u32]) -> Vec<u8> {
        let title = string_mhod(1, title);
        let mut items = Vec::new();
        for (i, &id) in track_ids.iter().enumerate() {
            let mhod = position_mhod(i as u32 + 1);
            items.extend(
                encode(&PlaylistItemHeader {
                    header_len: PLAYLIST_ITEM_HEADER_LEN,
                    total_len: PLAYLIST_ITEM_HEADER_LEN + mhod.len() as u32,
                    num_mhods: 1,
                    podcast_group_flag: 0,
                    group_id: i as u32,
                    track_id: id,
                    timestamp: 0,
                    podcast_group_ref: 0,
                })
                .unwrap(),
            );
            items.extend(mhod);
        }
        let mut block = encode(&PlaylistHeader {
            header_len: PLAYLIST_HEADER_LEN,
            total_len: PLAYLIST_HEADER_LEN + (title.len() + items.len()) as u32,
            num_mhods: 1,
            num_items: track_ids.len() as u32,
            main_flag: main as u32,
            timestamp: 0,
            playlist_id: 0,
            unknown1: 0,
            string_mhod_count: 1,
            podcast_flag: 0,
            sort_order: 0,
        })
        .unwrap();
        block.extend(title);
        block.extend(items);
        block
    }

    fn database(sections: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (kind, content) in sections {
            body.extend(encode(&SectionHeader::new(*kind, content.len())).unwrap());
            body.extend_from_slice(content);
        }
        let mut data = encode(&DatabaseHeader::new(
            0x68 + body.len() as u32,
            sections.len() as u32,
        ))
        .unwrap();
        data.extend(body);
        data
    }

    fn sample_database() -> Vec<u8> {
        let mut track = Track::new(2001);
        track.length_ms = 180_000;
        let mut tracks = encode(&TrackListHeader {
            header_len: LIST_HEADER_LEN,
            num_tracks: 1,
        })
        .unwrap();
        tracks.extend(track_block(
            &track,
            &[
                string_mhod(1, "Test"),
                string_mhod(4, "Unknown"),
                string_mhod(3, "Unknown"),
                string_mhod(2, ":iPod_Control:Music:F01:kpod2001.mp3"),
            ],
        ));

        let mut playlists = encode(&PlaylistListHeader {
            header_len: LIST_HEADER_LEN,
            num_playlists: 2,
        })
        .unwrap();
        playlists.extend(playlist_block("My iPod", true, &[2001]));
        playlists.extend(playlist_block("Favorites", false, &[2001, 2001]));

        database(&[(SECTION_TRACKS, tracks), (SECTION_PLAYLISTS, playlists)])
    }

    #[test]
    fn test_parse_tracks_and_playlists() {
        let mut collector = Collector::default();
        let summary = ItunesDbParser::new(&mut collector).parse(&sample_database());

        assert!(collector.finished);
        assert!(collector.errors.is_empty());
        assert_eq!(summary.tracks, 1);
        assert_eq!(summary.playlists, 2);
        assert!(!summary.truncated);

        let track = &collector.tracks[0];
        assert_eq!(track.id, 2001);
        assert_eq!(track.title(), "Test");
        assert_eq!(track.artist(), "Unknown");
        assert_eq!(track.length_ms, 180_000);

        assert!(collector.playlists[0].main);
        assert_eq!(collector.playlists[0].title(), "My iPod");
        assert_eq!(collector.playlists[1].title(), "Favorites");
        assert_eq!(collector.playlists[1].entries(), &[2001, 2001]);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut data = sample_database();
        data[0..4].copy_from_slice(b"xxxx");

        let mut collector = Collector::default();
        let summary = ItunesDbParser::new(&mut collector).parse(&data);

        assert!(summary.aborted);
        assert_eq!(collector.errors.len(), 1);
        assert!(collector.tracks.is_empty());
        assert!(!collector.finished);
    }

    #[test]
    fn test_unknown_tag_reports_once_and_halts() {
        let mut track = Track::new(7);
        track.set_title("first");
        let mut tracks = encode(&TrackListHeader {
            header_len: LIST_HEADER_LEN,
            num_tracks: 2,
        })
        .unwrap();
        tracks.extend(track_block(&track, &[string_mhod(1, "first")]));
        // bogus block followed by a valid track that must never be seen
        tracks.extend_from_slice(b"mhzz\x0c\x00\x00\x00\x0c\x00\x00\x00");
        tracks.extend(track_block(&Track::new(8), &[]));
        let data = database(&[(SECTION_TRACKS, tracks)]);

        let mut collector = Collector::default();
        let summary = ItunesDbParser::new(&mut collector).parse(&data);

        assert!(summary.aborted);
        assert_eq!(collector.errors.len(), 1);
        assert!(collector.errors[0].contains("mhzz"));
        assert!(collector.tracks.is_empty());
        assert!(!collector.finished);
    }

    #[test]
    fn test_truncated_final_block_is_tolerated() {
        let mut track = Track::new(3);
        track.layout = HeaderLayout::Itunes47;
        let mut section = encode(&TrackListHeader {
            header_len: LIST_HEADER_LEN,
            num_tracks: 1,
        })
        .unwrap();
        section.extend(track_block(
            &track,
            &[string_mhod(4, "Artist"), string_mhod(1, "A long title")],
        ));
        let full = database(&[(SECTION_TRACKS, section)]);
        // cut the last mhod short
        let data = &full[..full.len() - 10];

        let mut collector = Collector::default();
        let summary = ItunesDbParser::new(&mut collector).parse(data);

        assert!(summary.truncated);
        assert!(collector.errors.is_empty());
        assert!(collector.finished);
        assert_eq!(collector.tracks.len(), 1);
        let track = &collector.tracks[0];
        assert_eq!(track.layout, HeaderLayout::Itunes47);
        assert_eq!(track.artist(), "Artist");
        assert_eq!(track.album(), NO_ALBUM);
    }

    #[test]
    fn test_truncated_track_header() {
        let data = sample_database();
        // stop inside the first mhit header
        let cut = 0x68 + 0x60 + LIST_HEADER_LEN as usize + 0x40;

        let mut collector = Collector::default();
        let summary = ItunesDbParser::new(&mut collector).parse(&data[..cut]);

        assert!(summary.truncated);
        assert!(collector.tracks.is_empty());
        assert!(collector.errors.is_empty());
    }

    #[test]
    fn test_unrecognized_section_is_skipped() {
        let mut podcasts = encode(&PlaylistListHeader {
            header_len: LIST_HEADER_LEN,
            num_playlists: 1,
        })
        .unwrap();
        podcasts.extend(playlist_block("Podcasts", false, &[]));
        let mut playlists = encode(&PlaylistListHeader {
            header_len: LIST_HEADER_LEN,
            num_playlists: 1,
        })
        .unwrap();
        playlists.extend(playlist_block("Main", true, &[]));

        let data = database(&[(SECTION_PLAYLISTS, playlists), (3, podcasts)]);
        let mut collector = Collector::default();
        ItunesDbParser::new(&mut collector).parse(&data);

        assert_eq!(collector.playlists.len(), 1);
        assert_eq!(collector.playlists[0].title(), "Main");
    }
}
