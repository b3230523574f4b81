//! Fixture devices for unit tests

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::path::{to_host_path, track_path, ITUNESDB_PATH, MUSIC_DIR, MUSIC_DIR_COUNT};
use crate::track::Track;
use crate::tracklist::TrackList;
use crate::writer::{ItunesDbDataSource, ItunesDbWriter};

/// Hand-assembled database content
pub(crate) struct FixtureSource {
    pub main: Option<TrackList>,
    pub playlists: Vec<TrackList>,
    pub tracks: Vec<Track>,
    pub inits: usize,
    pub finishes: usize,
}

impl FixtureSource {
    pub fn new(name: &str) -> Self {
        let mut main = TrackList::new(name);
        main.main = true;
        Self {
            main: Some(main),
            playlists: Vec::new(),
            tracks: Vec::new(),
            inits: 0,
            finishes: 0,
        }
    }

    pub fn add_track(&mut self, track: Track) {
        if let Some(main) = self.main.as_mut() {
            main.add_playlist_item(track.id);
        }
        self.tracks.push(track);
    }

    pub fn add_playlist(&mut self, title: &str, track_ids: &[u32]) {
        let mut playlist = TrackList::new(title);
        for &id in track_ids {
            playlist.add_playlist_item(id);
        }
        self.playlists.push(playlist);
    }
}

impl ItunesDbDataSource for FixtureSource {
    fn write_init(&mut self) {
        self.inits += 1;
    }

    fn write_finished(&mut self) {
        self.finishes += 1;
    }

    fn main_playlist(&self) -> Option<&TrackList> {
        self.main.as_ref()
    }

    fn playlists(&self) -> Box<dyn Iterator<Item = &TrackList> + '_> {
        Box::new(self.playlists.iter())
    }

    fn tracks(&self) -> Box<dyn Iterator<Item = Track> + '_> {
        Box::new(self.tracks.iter().cloned())
    }

    fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn num_playlists(&self) -> usize {
        self.playlists.len()
    }
}

pub(crate) fn track(id: u32, artist: &str, album: &str, title: &str) -> Track {
    let mut track = Track::new(id);
    track.set_artist(artist);
    track.set_album(album);
    track.set_title(title);
    track.set_path(format!("{}.mp3", track_path(id, "kpod")));
    track.length_ms = 180_000;
    track
}

/// One track (2001, Unknown/Unknown/Test) referenced by "Favorites"
pub(crate) fn minimal_source() -> FixtureSource {
    let mut source = FixtureSource::new("iPod");
    source.add_track(track(2001, "Unknown", "Unknown", "Test"));
    source.add_playlist("Favorites", &[2001]);
    source
}

/// A few artists, albums and playlists
pub(crate) fn library_source() -> FixtureSource {
    let mut source = FixtureSource::new("Sam's iPod");
    source.add_track(track(2001, "Unknown", "Unknown", "Test"));

    let mut first = track(2002, "Low", "Things We Lost in the Fire", "Sunflower");
    first.track_number = 1;
    first.year = 2001;
    first.set_genre("Slowcore");
    source.add_track(first);

    let mut second = track(2003, "Low", "Things We Lost in the Fire", "Whitetail");
    second.track_number = 2;
    second.year = 2001;
    second.set_genre("Slowcore");
    source.add_track(second);

    let mut third = track(2004, "AC/DC", "Back in Black", "Hells Bells");
    third.track_number = 1;
    third.year = 1980;
    third.set_genre("Rock");
    third.play_count = 7;
    source.add_track(third);

    source.add_playlist("Favorites", &[2001, 2004]);
    source.add_playlist("Quiet", &[2002, 2003, 2002]);
    source
}

/// Create the device directory skeleton, write the database and put a small
/// file at every track path
pub(crate) fn create_device(source: &FixtureSource) -> TempDir {
    let tmp = TempDir::new().expect("tempdir");
    write_device(tmp.path(), source);
    tmp
}

pub(crate) fn write_device(base: &Path, source: &FixtureSource) {
    let db_path = base.join(ITUNESDB_PATH);
    fs::create_dir_all(db_path.parent().expect("parent")).expect("itunes dir");
    for bucket in 0..MUSIC_DIR_COUNT {
        fs::create_dir_all(base.join(MUSIC_DIR).join(format!("F{:02}", bucket)))
            .expect("music dir");
    }
    for track in &source.tracks {
        fs::write(to_host_path(base, track.path()), b"ID3").expect("track file");
    }
    let data = ItunesDbWriter::encode(source).expect("encode fixture");
    fs::write(db_path, data).expect("write fixture");
}
