//! In-memory index over an iTunesDB file
//!
//! Tracks are stored once, keyed by id. Albums and playlists only hold ids,
//! so removing a track means removing its id from every list that can
//! reference it:
//!
//! - the track map
//! - its album below its artist
//! - every playlist
//! - the main (device) playlist

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::parser::{ItunesDbListener, ItunesDbParser};
use crate::path::{escape_slashes, ITUNESDB_PATH, ITUNESSD_PATH};
use crate::track::Track;
use crate::tracklist::TrackList;
use crate::writer::{ItunesDbDataSource, ItunesDbWriter};

/// Album title -> album
pub type Artist = BTreeMap<String, TrackList>;

/// Main playlist title used when the database has none
pub const DEFAULT_DEVICE_NAME: &str = "iPod";

/// Track ids handed out by the engine start above this
pub const BASE_TRACK_ID: u32 = 2000;

#[derive(Debug)]
pub struct ItunesDb {
    tracks: BTreeMap<u32, Track>,
    artists: BTreeMap<String, Artist>,
    playlists: BTreeMap<String, TrackList>,
    mainlist: TrackList,
    mainlist_seen: bool,
    max_track_id: u32,
    /// Modification time of the database file when it was read
    timestamp: Option<SystemTime>,
    db_path: Option<PathBuf>,
    sd_path: Option<PathBuf>,
    changed: bool,
    error: Option<String>,
    resolve_slashes: bool,
    lock_file: Option<File>,
}

impl ItunesDb {
    pub fn new(resolve_slashes: bool) -> Self {
        Self {
            tracks: BTreeMap::new(),
            artists: BTreeMap::new(),
            playlists: BTreeMap::new(),
            mainlist: TrackList::default(),
            mainlist_seen: false,
            max_track_id: 0,
            timestamp: None,
            db_path: None,
            sd_path: None,
            changed: false,
            error: None,
            resolve_slashes,
            lock_file: None,
        }
    }

    /// Parse the database below the mount point `base`
    ///
    /// On failure the index is left cleared and can be opened again.
    pub fn open<P: AsRef<Path>>(&mut self, base: P) -> Result<()> {
        let base = base.as_ref();
        self.clear();

        let db_path = base.join(ITUNESDB_PATH);
        if !db_path.exists() {
            return Err(Error::DoesNotExist(format!("{:?}", db_path)));
        }
        let timestamp = fs::metadata(&db_path)?.modified()?;

        let summary = ItunesDbParser::new(self).parse_file(&db_path)?;
        if let Some(message) = self.error.take() {
            self.clear();
            return Err(Error::Parse(message));
        }

        self.timestamp = Some(timestamp);
        self.db_path = Some(db_path);
        self.sd_path = Some(base.join(ITUNESSD_PATH));
        info!(
            "Opened iTunesDB at {:?}: {} tracks, {} playlists{}",
            base,
            summary.tracks,
            self.playlists.len(),
            if summary.truncated { " (truncated)" } else { "" }
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Serialize the index to `path`, or back to the file it was read from
    ///
    /// Writing the opened file also writes `iTunesSD` when the device has one
    /// and takes a new modification-time snapshot.
    pub fn write_database(&mut self, path: Option<&Path>) -> Result<()> {
        let db_path = self.db_path.clone().ok_or(Error::NotOpen)?;
        let target = path.map(Path::to_path_buf).unwrap_or_else(|| db_path.clone());

        ItunesDbWriter::write_file(self, &target)?;

        if let Some(sd_path) = self.sd_path.as_ref().filter(|p| p.exists()) {
            let data = ItunesDbWriter::encode_shuffle(self)?;
            fs::write(sd_path, data)?;
            debug!("Wrote shuffle database {:?}", sd_path);
        }

        if target == db_path {
            self.timestamp = Some(fs::metadata(&db_path)?.modified()?);
        }
        Ok(())
    }

    /// Whether the database file is gone or was modified since it was read
    pub fn db_file_changed(&self) -> bool {
        let Some(path) = self.db_path.as_ref() else {
            return true;
        };
        match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => Some(modified) != self.timestamp,
            Err(_) => true,
        }
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Message of the last parse error, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.artists.clear();
        self.playlists.clear();
        self.mainlist = TrackList::default();
        self.mainlist_seen = false;
        self.max_track_id = 0;
        self.timestamp = None;
        self.db_path = None;
        self.sd_path = None;
        self.changed = false;
        self.lock_file = None;
    }

    fn key(&self, name: &str) -> String {
        if self.resolve_slashes {
            escape_slashes(name)
        } else {
            name.to_string()
        }
    }

    /// Insert into the track map and the artist/album index
    fn insert_track_to_database(&mut self, mut track: Track) {
        let artist_key = self.key(track.artist());
        let album_key = self.key(track.album());

        let album = self
            .artists
            .entry(artist_key)
            .or_default()
            .entry(album_key.clone())
            .or_insert_with(|| TrackList::new(album_key));
        let position = album.add_playlist_item(track.id);

        if track.track_number == 0 {
            track.track_number = position;
        }
        self.tracks.insert(track.id, track);
    }

    /// Add a track to the index and the main playlist
    pub fn add_track(&mut self, track: Track) -> Result<()> {
        if track.id == 0 {
            return Err(Error::Internal("track id 0 is reserved".into()));
        }
        if self.tracks.contains_key(&track.id) {
            return Err(Error::AlreadyExists(format!("track {}", track.id)));
        }
        self.max_track_id = self.max_track_id.max(track.id);
        self.mainlist.add_playlist_item(track.id);
        self.insert_track_to_database(track);
        self.changed = true;
        Ok(())
    }

    pub fn track_by_id(&self, id: u32) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn max_track_id(&self) -> u32 {
        self.max_track_id
    }

    /// Artist keys in order
    pub fn artists(&self) -> impl Iterator<Item = &str> {
        self.artists.keys().map(String::as_str)
    }

    pub fn artist_by_name(&self, name: &str) -> Option<&Artist> {
        self.artists.get(&self.key(name))
    }

    pub fn album(&self, artist: &str, album: &str) -> Option<&TrackList> {
        self.artists.get(&self.key(artist))?.get(&self.key(album))
    }

    pub fn main_playlist(&self) -> &TrackList {
        &self.mainlist
    }

    pub fn set_main_title(&mut self, title: &str) {
        self.mainlist.set_title(title);
        self.changed = true;
    }

    pub fn playlist_by_title(&self, title: &str) -> Option<&TrackList> {
        self.playlists.get(title)
    }

    /// Callers mark the index changed once they have actually mutated
    pub fn playlist_by_title_mut(&mut self, title: &str) -> Option<&mut TrackList> {
        self.playlists.get_mut(title)
    }

    pub fn playlist_titles(&self) -> impl Iterator<Item = &str> {
        self.playlists.keys().map(String::as_str)
    }

    /// Insert a playlist unless one with the same title exists
    ///
    /// Returns `false` and drops the playlist on a duplicate title.
    pub fn insert_playlist(&mut self, mut playlist: TrackList) -> bool {
        if self.playlists.contains_key(playlist.title()) {
            return false;
        }
        let max_number = playlist
            .track_ids()
            .filter_map(|id| self.tracks.get(&id))
            .map(|track| track.track_number)
            .max()
            .unwrap_or(0);
        if max_number > playlist.max_track_number() {
            playlist.set_max_track_number(max_number);
        }
        playlist.main = false;
        self.playlists.insert(playlist.title().to_string(), playlist);
        self.changed = true;
        true
    }

    pub fn remove_playlist(&mut self, title: &str) -> Option<TrackList> {
        let removed = self.playlists.remove(title);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    /// Remove an artist whose album map is already empty
    pub fn remove_artist(&mut self, name: &str) -> Result<()> {
        let key = self.key(name);
        match self.artists.get(&key) {
            None => Err(Error::DoesNotExist(format!("artist {}", name))),
            Some(albums) if !albums.is_empty() => Err(Error::NotEmpty(format!(
                "artist {} has {} albums",
                name,
                albums.len()
            ))),
            Some(_) => {
                self.artists.remove(&key);
                self.changed = true;
                Ok(())
            }
        }
    }

    /// Drop an album entry, its tracks stay untouched
    pub fn remove_album(&mut self, artist: &str, album: &str) -> Option<TrackList> {
        let artist_key = self.key(artist);
        let album_key = self.key(album);
        let removed = self.artists.get_mut(&artist_key)?.remove(&album_key);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    /// Remove a track from every index
    pub fn remove_track(&mut self, id: u32) -> Option<Track> {
        let track = self.tracks.remove(&id)?;

        let artist_key = self.key(track.artist());
        let album_key = self.key(track.album());
        if let Some(album) = self
            .artists
            .get_mut(&artist_key)
            .and_then(|artist| artist.get_mut(&album_key))
        {
            album.remove_all(id);
        }
        for playlist in self.playlists.values_mut() {
            playlist.remove_all(id);
        }
        self.mainlist.remove_all(id);

        self.changed = true;
        Some(track)
    }

    /// Move an album under a (possibly different) artist with a new title
    ///
    /// Every track in the album gets the new artist and album names.
    pub fn rename_album(
        &mut self,
        artist: &str,
        album: &str,
        new_artist: &str,
        new_album: &str,
    ) -> Result<()> {
        if self.album(new_artist, new_album).is_some() {
            return Err(Error::AlreadyExists(format!("album {} / {}", new_artist, new_album)));
        }
        let mut list = self
            .remove_album(artist, album)
            .ok_or_else(|| Error::DoesNotExist(format!("album {} / {}", artist, album)))?;

        for id in list.track_ids() {
            if let Some(track) = self.tracks.get_mut(&id) {
                track.set_artist(new_artist);
                track.set_album(new_album);
            }
        }

        let artist_key = self.key(new_artist);
        let album_key = self.key(new_album);
        list.set_title(album_key.clone());
        self.artists
            .entry(artist_key)
            .or_default()
            .insert(album_key, list);
        self.changed = true;

        if self.album(new_artist, new_album).is_none() {
            return Err(Error::Internal(format!(
                "album {} / {} missing after rename",
                new_artist, new_album
            )));
        }
        Ok(())
    }

    /// Re-file a single track under another artist and album
    pub fn move_track(&mut self, id: u32, new_artist: &str, new_album: &str) -> Result<()> {
        let (artist_key, album_key) = match self.tracks.get(&id) {
            Some(track) => (self.key(track.artist()), self.key(track.album())),
            None => return Err(Error::DoesNotExist(format!("track {}", id))),
        };
        let album = self
            .artists
            .get_mut(&artist_key)
            .and_then(|artist| artist.get_mut(&album_key))
            .ok_or_else(|| Error::DoesNotExist(format!("album of track {}", id)))?;
        album.remove_all(id);

        let Some(mut track) = self.tracks.remove(&id) else {
            return Err(Error::Internal(format!("track {} vanished", id)));
        };
        track.set_artist(new_artist);
        track.set_album(new_album);
        self.insert_track_to_database(track);
        self.changed = true;
        Ok(())
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    /// Take an advisory lock on the database file
    pub fn lock(&mut self, write: bool) -> Result<()> {
        let path = self.db_path.as_ref().ok_or(Error::NotOpen)?;
        let file = File::open(path)?;
        if write {
            file.lock()?;
        } else {
            file.lock_shared()?;
        }
        self.lock_file = Some(file);
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = self.lock_file.take() {
            file.unlock()?;
        }
        Ok(())
    }
}

impl Default for ItunesDb {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ItunesDbListener for ItunesDb {
    fn parse_started(&mut self) {
        self.error = None;
        self.changed = true;
    }

    fn parse_finished(&mut self) {
        self.changed = false;

        if self.mainlist.title().is_empty() {
            self.mainlist.set_title(DEFAULT_DEVICE_NAME);
        }
        if self.max_track_id == 0 {
            self.max_track_id = BASE_TRACK_ID;
        }

        for artist in self.artists.values_mut() {
            for album in artist.values_mut() {
                album.set_changed(false);
            }
        }
        self.mainlist.set_changed(false);

        let tracks = &self.tracks;
        for playlist in self.playlists.values_mut() {
            let removed = playlist.retain(|id| tracks.contains_key(&id));
            if removed > 0 {
                warn!(
                    "Dropped {} unknown track references from playlist {:?}",
                    removed,
                    playlist.title()
                );
                self.changed = true;
            }
        }
    }

    fn handle_track(&mut self, track: Track) {
        if track.id == 0 {
            return;
        }
        if let Err(e) = self.add_track(track) {
            warn!("Skipping track: {}", e);
        }
    }

    fn handle_playlist(&mut self, playlist: TrackList) {
        if !self.mainlist_seen {
            // the main playlist is rebuilt from the tracks, only its header matters
            self.mainlist_seen = true;
            self.mainlist.set_title(playlist.title());
            self.mainlist.main = true;
            self.mainlist.playlist_id = playlist.playlist_id;
            self.mainlist.timestamp = playlist.timestamp;
            self.mainlist.sort_order = playlist.sort_order;
            return;
        }

        let title = playlist.title().to_string();
        if !self.insert_playlist(playlist) {
            warn!("Dropping duplicate playlist {:?}", title);
        }
    }

    fn handle_error(&mut self, message: &str) {
        warn!("iTunesDB parse error: {}", message);
        self.error = Some(message.to_string());
    }
}

impl ItunesDbDataSource for ItunesDb {
    fn write_init(&mut self) {
        self.error = None;
        for playlist in self.playlists.values_mut() {
            playlist.purge_deleted();
        }
    }

    fn write_finished(&mut self) {
        self.changed = false;
    }

    fn main_playlist(&self) -> Option<&TrackList> {
        self.is_open().then_some(&self.mainlist)
    }

    fn playlists(&self) -> Box<dyn Iterator<Item = &TrackList> + '_> {
        Box::new(self.playlists.values())
    }

    fn tracks(&self) -> Box<dyn Iterator<Item = Track> + '_> {
        Box::new(self.tracks.values().map(|track| {
            let mut track = track.clone();
            if let Some(album) = self.album(track.artist(), track.album()) {
                track.num_tracks = album.num_tracks() as u32;
            }
            track
        }))
    }

    fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn num_playlists(&self) -> usize {
        self.playlists.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{create_device, library_source, minimal_source, track};
    use crate::tracklist::LISTITEM_DELETED;
    use tempfile::TempDir;

    fn open(source: &crate::test_support::FixtureSource) -> (TempDir, ItunesDb) {
        let device = create_device(source);
        let mut db = ItunesDb::new(true);
        db.open(device.path()).unwrap();
        (device, db)
    }

    #[test]
    fn test_open_builds_indices() {
        let (_device, db) = open(&library_source());

        assert!(db.is_open());
        assert!(!db.is_changed());
        assert_eq!(db.num_tracks(), 4);
        assert_eq!(db.max_track_id(), 2004);
        assert_eq!(db.main_playlist().title(), "Sam's iPod");
        assert_eq!(db.main_playlist().num_tracks(), 4);

        let artists: Vec<_> = db.artists().collect();
        assert_eq!(artists, vec!["AC%2fDC", "Low", "Unknown"]);
        assert!(db.album("AC/DC", "Back in Black").is_some());

        let quiet = db.playlist_by_title("Quiet").unwrap();
        assert_eq!(quiet.entries(), &[2002, 2003, 2002]);
        assert_eq!(quiet.max_track_number(), 2);
        assert_eq!(db.playlist_titles().collect::<Vec<_>>(), vec!["Favorites", "Quiet"]);
    }

    #[test]
    fn test_open_missing_database() {
        let tmp = TempDir::new().unwrap();
        let mut db = ItunesDb::new(true);
        assert!(matches!(db.open(tmp.path()), Err(Error::DoesNotExist(_))));
        assert!(!db.is_open());
        assert!(db.db_file_changed());
    }

    #[test]
    fn test_open_malformed_database_leaves_index_closed() {
        let device = create_device(&minimal_source());
        let path = device.path().join(ITUNESDB_PATH);
        let mut data = fs::read(&path).unwrap();
        data[0..4].copy_from_slice(b"junk");
        fs::write(&path, data).unwrap();

        let mut db = ItunesDb::new(true);
        assert!(matches!(db.open(device.path()), Err(Error::Parse(_))));
        assert!(!db.is_open());
        assert_eq!(db.num_tracks(), 0);
    }

    #[test]
    fn test_empty_database_defaults() {
        let mut source = crate::test_support::FixtureSource::new("");
        source.add_playlist("Favorites", &[]);
        let (_device, db) = open(&source);

        assert_eq!(db.main_playlist().title(), DEFAULT_DEVICE_NAME);
        assert_eq!(db.max_track_id(), BASE_TRACK_ID);
    }

    #[test]
    fn test_unknown_playlist_entries_are_swept() {
        let mut source = minimal_source();
        source.add_playlist("Dangling", &[2001, 9999, 2001]);
        let (_device, db) = open(&source);

        assert_eq!(db.playlist_by_title("Dangling").unwrap().entries(), &[2001, 2001]);
        assert!(db.is_changed());
    }

    #[test]
    fn test_duplicate_playlist_title_first_wins() {
        let mut source = minimal_source();
        source.add_playlist("Favorites", &[]);
        let (_device, db) = open(&source);

        assert_eq!(db.playlist_titles().count(), 1);
        assert_eq!(db.playlist_by_title("Favorites").unwrap().num_tracks(), 1);
    }

    #[test]
    fn test_remove_track_from_every_index() {
        let (_device, mut db) = open(&library_source());

        let removed = db.remove_track(2002).unwrap();
        assert_eq!(removed.title(), "Sunflower");

        assert!(db.track_by_id(2002).is_none());
        let album = db.album("Low", "Things We Lost in the Fire").unwrap();
        assert!(!album.contains(2002));
        assert!(!db.playlist_by_title("Quiet").unwrap().contains(2002));
        assert!(!db.main_playlist().contains(2002));
        assert!(db.remove_track(2002).is_none());
    }

    #[test]
    fn test_remove_artist_requires_empty_album_map() {
        let (_device, mut db) = open(&library_source());

        assert!(matches!(db.remove_artist("Low"), Err(Error::NotEmpty(_))));
        assert!(matches!(db.remove_artist("Nobody"), Err(Error::DoesNotExist(_))));

        db.remove_album("AC/DC", "Back in Black").unwrap();
        db.remove_artist("AC/DC").unwrap();
        assert!(db.artist_by_name("AC/DC").is_none());
    }

    #[test]
    fn test_rename_album_rekeys_and_updates_tracks() {
        let (_device, mut db) = open(&library_source());

        db.rename_album("Low", "Things We Lost in the Fire", "Low", "Trust")
            .unwrap();
        assert!(db.album("Low", "Things We Lost in the Fire").is_none());
        let album = db.album("Low", "Trust").unwrap();
        assert_eq!(album.title(), "Trust");
        assert_eq!(album.num_tracks(), 2);
        assert_eq!(db.track_by_id(2003).unwrap().album(), "Trust");

        db.rename_album("Low", "Trust", "Mimi & Alan", "Trust").unwrap();
        assert_eq!(db.track_by_id(2002).unwrap().artist(), "Mimi & Alan");

        let existing = db.rename_album("Unknown", "Unknown", "Mimi & Alan", "Trust");
        assert!(matches!(existing, Err(Error::AlreadyExists(_))));
        assert!(db.album("Unknown", "Unknown").is_some());

        let missing = db.rename_album("Unknown", "Nope", "Unknown", "Yes");
        assert!(matches!(missing, Err(Error::DoesNotExist(_))));
    }

    #[test]
    fn test_move_track() {
        let (_device, mut db) = open(&library_source());

        db.move_track(2004, "AC/DC", "Highway to Hell").unwrap();
        assert!(db.album("AC/DC", "Back in Black").unwrap().is_empty());
        assert!(db.album("AC/DC", "Highway to Hell").unwrap().contains(2004));
        assert_eq!(db.track_by_id(2004).unwrap().album(), "Highway to Hell");
        // still in its playlists
        assert!(db.playlist_by_title("Favorites").unwrap().contains(2004));

        assert!(matches!(
            db.move_track(4242, "x", "y"),
            Err(Error::DoesNotExist(_))
        ));
    }

    #[test]
    fn test_track_number_defaults_to_album_position() {
        let (_device, mut db) = open(&minimal_source());

        db.add_track(track(2100, "Unknown", "Unknown", "Second")).unwrap();
        assert_eq!(db.track_by_id(2100).unwrap().track_number, 2);
        assert!(matches!(
            db.add_track(track(2100, "a", "b", "c")),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(db.max_track_id(), 2100);
    }

    #[test]
    fn test_write_and_reopen() {
        let (device, mut db) = open(&library_source());

        db.playlist_by_title_mut("Quiet")
            .unwrap()
            .set_track_id_at(0, LISTITEM_DELETED);
        db.remove_track(2001);
        db.write_database(None).unwrap();
        assert!(!db.is_changed());
        assert!(!db.db_file_changed());

        let mut reopened = ItunesDb::new(true);
        reopened.open(device.path()).unwrap();
        assert_eq!(reopened.num_tracks(), 3);
        assert_eq!(reopened.playlist_by_title("Quiet").unwrap().entries(), &[2003, 2002]);
        assert_eq!(reopened.playlist_by_title("Favorites").unwrap().entries(), &[2004]);

        // album size is refreshed into every written track
        let track = reopened.track_by_id(2003).unwrap();
        assert_eq!(track.num_tracks, 2);
    }

    #[test]
    fn test_write_to_other_path_keeps_snapshot() {
        let (device, mut db) = open(&minimal_source());
        let copy = device.path().join("copy");
        db.write_database(Some(&copy)).unwrap();
        assert!(copy.exists());
        assert!(!db.db_file_changed());
    }

    #[test]
    fn test_shuffle_database_written_only_when_present() {
        let (device, mut db) = open(&minimal_source());
        let sd = device.path().join(ITUNESSD_PATH);

        db.write_database(None).unwrap();
        assert!(!sd.exists());

        fs::write(&sd, b"").unwrap();
        db.write_database(None).unwrap();
        assert_eq!(fs::metadata(&sd).unwrap().len(), 18 + 558);
    }

    #[test]
    fn test_lock_and_unlock() {
        let (_device, mut db) = open(&minimal_source());
        db.lock(true).unwrap();
        db.unlock().unwrap();
        db.lock(false).unwrap();
        db.unlock().unwrap();

        let mut closed = ItunesDb::new(true);
        assert!(matches!(closed.lock(true), Err(Error::NotOpen)));
    }
}
