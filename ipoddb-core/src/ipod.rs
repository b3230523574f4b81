//! Device facade
//!
//! [`IPod`] owns the index of one mounted device and its action log. Every
//! mutation is expressed as a [`LogAction`] and goes through [`IPod::apply`],
//! which validates it against the index, performs it and appends it to the
//! log. Replaying a log is `apply` with logging suppressed.
//!
//! Several processes may hold the same device open. Each keeps a snapshot of
//! the database modification time and a log cursor:
//!
//! - database unchanged: entries past the cursor were written by a peer and
//!   are replayed
//! - database rewritten: the log no longer describes it and is discarded

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::itunesdb::{Artist, ItunesDb};
use crate::log::{log_file_path, ActionLog, LogAction, Snapshot};
use crate::path::{to_host_path, track_path};
use crate::track::{mac_timestamp_now, Track};
use crate::tracklist::{TrackList, LISTITEM_DELETED};

/// File name stem of tracks created by this engine
pub const TRACK_FILE_STEM: &str = "kpod";

/// Whether a mutation is appended to the action log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logging {
    Record,
    /// Replaying entries that are already in the log
    Suppress,
}

#[derive(Debug)]
pub struct IPod {
    base: PathBuf,
    db: ItunesDb,
    log: Option<ActionLog>,
    locked: bool,
    pending_changes: bool,
}

impl Default for IPod {
    fn default() -> Self {
        Self::new()
    }
}

impl IPod {
    pub fn new() -> Self {
        Self {
            base: PathBuf::new(),
            db: ItunesDb::new(true),
            log: None,
            locked: false,
            pending_changes: false,
        }
    }

    /// Open the device mounted at `base`
    pub fn open<P: AsRef<Path>>(&mut self, base: P) -> Result<()> {
        self.base = base.as_ref().to_path_buf();
        self.log = None;
        self.locked = false;
        self.pending_changes = false;

        self.db.open(&self.base)?;
        let mtime = self.db.timestamp().ok_or(Error::NotOpen)?;
        self.log = Some(ActionLog::new(log_file_path(&self.base, mtime)));
        Ok(())
    }

    /// Discard the log and the in-memory index
    pub fn close(&mut self) -> Result<()> {
        self.flush_log()?;
        if self.locked {
            self.unlock()?;
        }
        self.db.clear();
        self.log = None;
        info!("Closed device {:?}", self.base);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }

    /// Whether the database file is the one this session read
    pub fn is_still_connected(&self) -> bool {
        !self.db.db_file_changed()
    }

    /// Catch up with peers, `false` if the device database changed underneath
    ///
    /// A `false` result means the log was discarded and the device has to be
    /// opened again.
    pub fn ensure_consistency(&mut self) -> Result<bool> {
        if !self.is_still_connected() {
            info!("Device database changed, discarding action log");
            self.flush_log()?;
            return Ok(false);
        }
        self.replay_log()?;
        Ok(true)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            mtime: self.db.timestamp(),
            cursor: self.log.as_ref().map(ActionLog::cursor).unwrap_or(0),
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.base
    }

    pub fn database(&self) -> &ItunesDb {
        &self.db
    }

    pub fn has_pending_changes(&self) -> bool {
        self.pending_changes
    }

    /// Host path of a device path
    pub fn real_path(&self, ipod_path: &str) -> PathBuf {
        to_host_path(&self.base, ipod_path)
    }

    /// Device name, stored as the main playlist title
    pub fn name(&self) -> &str {
        self.db.main_playlist().title()
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.check_open()?;
        self.db.set_main_title(name);
        self.pending_changes = true;
        Ok(())
    }

    pub fn track_by_id(&self, id: u32) -> Option<&Track> {
        self.db.track_by_id(id)
    }

    pub fn artists(&self) -> Vec<String> {
        self.db.artists().map(str::to_string).collect()
    }

    pub fn artist_by_name(&self, name: &str) -> Option<&Artist> {
        self.db.artist_by_name(name)
    }

    pub fn album(&self, artist: &str, album: &str) -> Option<&TrackList> {
        self.db.album(artist, album)
    }

    pub fn playlist_by_title(&self, title: &str) -> Option<&TrackList> {
        self.db.playlist_by_title(title)
    }

    pub fn playlist_titles(&self) -> Vec<String> {
        self.db.playlist_titles().map(str::to_string).collect()
    }

    /// A track shell with the next free id and its device path
    ///
    /// Nothing is reserved: calling this twice without [`IPod::add_track`] in
    /// between returns the same id.
    pub fn create_new_track_metadata(&self) -> Result<Track> {
        self.check_open()?;
        let next = |id: u32| {
            id.checked_add(1)
                .ok_or_else(|| Error::Internal("track id space exhausted".into()))
        };
        let mut id = next(self.db.max_track_id())?;
        while self.db.track_by_id(id).is_some() {
            id = next(id)?;
        }

        let mut track = Track::new(id);
        track.set_path(track_path(id, TRACK_FILE_STEM));
        track.date_added = mac_timestamp_now();
        let seed = format!("{}:{}", self.base.display(), id);
        track.dbid = xxh3_64(seed.as_bytes());
        track.dbid2 = track.dbid;
        Ok(track)
    }

    pub fn create_playlist(&mut self, title: &str) -> Result<()> {
        self.apply(LogAction::AddPlaylist { title: title.into() }, Logging::Record)
    }

    pub fn rename_playlist(&mut self, title: &str, new_title: &str) -> Result<()> {
        self.apply(
            LogAction::RenamePlaylist {
                title: title.into(),
                new_title: new_title.into(),
            },
            Logging::Record,
        )
    }

    pub fn delete_playlist(&mut self, title: &str) -> Result<()> {
        self.apply(LogAction::RemovePlaylist { title: title.into() }, Logging::Record)
    }

    pub fn add_track_to_playlist(&mut self, track_id: u32, title: &str) -> Result<()> {
        self.apply(
            LogAction::AddToPlaylist {
                title: title.into(),
                track_id,
            },
            Logging::Record,
        )
    }

    /// Clear the entry at a 0-based position, later positions keep their index
    pub fn remove_from_playlist(&mut self, position: u32, title: &str) -> Result<()> {
        self.apply(
            LogAction::RemoveFromPlaylist {
                title: title.into(),
                position,
            },
            Logging::Record,
        )
    }

    /// Register a track whose file is already in place
    pub fn add_track(&mut self, track: Track) -> Result<()> {
        self.apply(LogAction::AddTrack { track: Box::new(track) }, Logging::Record)
    }

    pub fn delete_track(&mut self, track_id: u32) -> Result<()> {
        self.apply(LogAction::RemoveTrack { track_id }, Logging::Record)
    }

    pub fn move_track(&mut self, track_id: u32, artist: &str, album: &str) -> Result<()> {
        self.apply(
            LogAction::MoveTrack {
                track_id,
                artist: artist.into(),
                album: album.into(),
            },
            Logging::Record,
        )
    }

    pub fn rename_album(
        &mut self,
        artist: &str,
        album: &str,
        new_artist: &str,
        new_album: &str,
    ) -> Result<()> {
        self.apply(
            LogAction::RenameAlbum {
                artist: artist.into(),
                album: album.into(),
                new_artist: new_artist.into(),
                new_album: new_album.into(),
            },
            Logging::Record,
        )
    }

    /// Remove an album, its tracks and their files
    pub fn delete_album(&mut self, artist: &str, album: &str) -> Result<()> {
        self.apply(
            LogAction::RemoveAlbum {
                artist: artist.into(),
                album: album.into(),
            },
            Logging::Record,
        )
    }

    pub fn delete_artist(&mut self, artist: &str) -> Result<()> {
        self.apply(LogAction::DeleteArtist { artist: artist.into() }, Logging::Record)
    }

    /// Perform a mutation and, unless suppressed, append it to the log
    ///
    /// A failed mutation leaves the index unchanged and is not logged. When
    /// recording, entries other sessions appended first are applied under the
    /// write lock, and the mutation is only made once its log file is open.
    pub fn apply(&mut self, action: LogAction, logging: Logging) -> Result<()> {
        self.check_open()?;
        match logging {
            Logging::Suppress => self.apply_to_index(&action)?,
            Logging::Record => self.apply_and_log(&action)?,
        }
        self.pending_changes = true;
        Ok(())
    }

    fn apply_and_log(&mut self, action: &LogAction) -> Result<()> {
        let Some(mut log) = self.log.take() else {
            return self.apply_to_index(action);
        };
        let unlock = !self.locked;
        if unlock {
            if let Err(e) = self.db.lock(true) {
                self.log = Some(log);
                return Err(e);
            }
        }
        let result = self.apply_and_log_locked(&mut log, action);
        self.log = Some(log);
        if unlock {
            self.db.unlock()?;
        }
        result
    }

    fn apply_and_log_locked(&mut self, log: &mut ActionLog, action: &LogAction) -> Result<()> {
        let pending = log.read_pending()?;
        self.apply_actions(pending);

        let entry = log.prepare(action)?;
        self.apply_to_index(action)?;
        log.commit(entry)
    }

    /// Apply entries read from the log, returns how many applied
    fn apply_actions(&mut self, actions: Vec<LogAction>) -> usize {
        let mut applied = 0;
        for action in actions {
            let kind = action.action_type();
            match self.apply_to_index(&action) {
                Ok(()) => applied += 1,
                Err(e) => debug!("Replayed {:?} did not apply: {}", kind, e),
            }
        }
        if applied > 0 {
            self.pending_changes = true;
            info!("Replayed {} log entries", applied);
        }
        applied
    }

    fn apply_to_index(&mut self, action: &LogAction) -> Result<()> {
        match action {
            LogAction::AddPlaylist { title } => {
                if !self.db.insert_playlist(TrackList::new(title.as_str())) {
                    return Err(Error::AlreadyExists(format!("playlist {}", title)));
                }
            }
            LogAction::RemovePlaylist { title } => {
                if self.db.remove_playlist(title).is_none() {
                    return Err(Error::DoesNotExist(format!("playlist {}", title)));
                }
            }
            LogAction::RenamePlaylist { title, new_title } => {
                self.rename_playlist_in_index(title, new_title)?;
            }
            LogAction::AddToPlaylist { title, track_id } => {
                if self.db.track_by_id(*track_id).is_none() {
                    return Err(Error::DoesNotExist(format!("track {}", track_id)));
                }
                let playlist = self
                    .db
                    .playlist_by_title_mut(title)
                    .ok_or_else(|| Error::DoesNotExist(format!("playlist {}", title)))?;
                playlist.add_playlist_item(*track_id);
                self.db.set_changed(true);
            }
            LogAction::RemoveFromPlaylist { title, position } => {
                let playlist = self
                    .db
                    .playlist_by_title_mut(title)
                    .ok_or_else(|| Error::DoesNotExist(format!("playlist {}", title)))?;
                if !playlist.set_track_id_at(*position as usize, LISTITEM_DELETED) {
                    return Err(Error::DoesNotExist(format!(
                        "position {} in playlist {}",
                        position, title
                    )));
                }
                self.db.set_changed(true);
            }
            LogAction::AddTrack { track } => {
                self.db.add_track(track.as_ref().clone())?;
            }
            LogAction::RemoveTrack { track_id } => {
                if self.db.remove_track(*track_id).is_none() {
                    return Err(Error::DoesNotExist(format!("track {}", track_id)));
                }
            }
            LogAction::MoveTrack { track_id, artist, album } => {
                self.db.move_track(*track_id, artist, album)?;
            }
            LogAction::RenameAlbum { artist, album, new_artist, new_album } => {
                self.db.rename_album(artist, album, new_artist, new_album)?;
            }
            LogAction::RemoveAlbum { artist, album } => {
                self.delete_album_in_index(artist, album)?;
            }
            LogAction::DeleteArtist { artist } => {
                self.db.remove_artist(artist)?;
            }
        }
        Ok(())
    }

    fn rename_playlist_in_index(&mut self, title: &str, new_title: &str) -> Result<()> {
        if self.db.playlist_by_title(new_title).is_some() {
            return Err(Error::AlreadyExists(format!("playlist {}", new_title)));
        }
        let mut playlist = self
            .db
            .remove_playlist(title)
            .ok_or_else(|| Error::DoesNotExist(format!("playlist {}", title)))?;
        playlist.set_title(new_title);
        if !self.db.insert_playlist(playlist) {
            return Err(Error::Internal(format!("could not insert playlist {}", new_title)));
        }
        Ok(())
    }

    fn delete_album_in_index(&mut self, artist: &str, album: &str) -> Result<()> {
        let track_ids: Vec<u32> = self
            .db
            .album(artist, album)
            .ok_or_else(|| Error::DoesNotExist(format!("album {} / {}", artist, album)))?
            .track_ids()
            .collect();

        for id in track_ids {
            let Some(track) = self.db.remove_track(id) else {
                continue;
            };
            let file = self.real_path(track.path());
            match fs::remove_file(&file) {
                Ok(()) => debug!("Removed {:?}", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {:?}: {}", file, e),
            }
        }
        self.db.remove_album(artist, album);
        Ok(())
    }

    /// Rewrite the device database and start a fresh log
    pub fn write_itunes_db(&mut self) -> Result<()> {
        self.check_open()?;
        self.db.write_database(None)?;
        self.flush_log()?;
        if let Some(mtime) = self.db.timestamp() {
            self.log = Some(ActionLog::new(log_file_path(&self.base, mtime)));
        }
        self.pending_changes = false;
        info!("Wrote device database for {:?}", self.base);
        Ok(())
    }

    /// Apply log entries written by other sessions, returns how many applied
    pub fn replay_log(&mut self) -> Result<usize> {
        self.check_open()?;
        let unlock = !self.locked;
        if unlock {
            self.db.lock(false)?;
        }
        let pending = match self.log.as_mut() {
            Some(log) => log.read_pending(),
            None => Ok(Vec::new()),
        };
        if unlock {
            self.db.unlock()?;
        }

        Ok(self.apply_actions(pending?))
    }

    /// Delete the log file and reset the cursor
    pub fn flush_log(&mut self) -> Result<()> {
        match self.log.as_mut() {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    /// Hold an advisory lock on the database across several operations
    pub fn lock(&mut self, write: bool) -> Result<()> {
        self.db.lock(write)?;
        self.locked = true;
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        if self.locked {
            self.db.unlock()?;
            self.locked = false;
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn check_open(&self) -> Result<()> {
        if self.db.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ITUNESDB_PATH;
    use crate::test_support::{create_device, library_source, minimal_source, track, FixtureSource};
    use std::time::{Duration, SystemTime};

    fn open(device: &Path) -> IPod {
        let mut ipod = IPod::new();
        ipod.open(device).unwrap();
        ipod
    }

    #[test]
    fn test_delete_album_scenario() {
        let device = create_device(&minimal_source());
        let mut ipod = open(device.path());
        let file = ipod.real_path(ipod.track_by_id(2001).unwrap().path());
        assert!(file.exists());

        ipod.delete_album("Unknown", "Unknown").unwrap();

        assert!(ipod.album("Unknown", "Unknown").is_none());
        assert!(ipod.track_by_id(2001).is_none());
        assert_eq!(ipod.playlist_by_title("Favorites").unwrap().num_tracks(), 0);
        assert!(!file.exists());

        assert!(matches!(
            ipod.delete_album("Unknown", "Unknown"),
            Err(Error::DoesNotExist(_))
        ));
    }

    #[test]
    fn test_rename_playlist_scenario() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());

        ipod.rename_playlist("Favorites", "Best").unwrap();
        let before: Vec<_> = ipod
            .playlist_titles()
            .iter()
            .map(|t| ipod.playlist_by_title(t).cloned())
            .collect();

        let result = ipod.rename_playlist("Old", "New");
        assert!(matches!(result, Err(Error::DoesNotExist(_))));

        let after: Vec<_> = ipod
            .playlist_titles()
            .iter()
            .map(|t| ipod.playlist_by_title(t).cloned())
            .collect();
        assert_eq!(before, after);
        assert_eq!(ipod.playlist_titles(), vec!["Best", "Quiet"]);
        assert_eq!(ipod.playlist_by_title("Best").unwrap().entries(), &[2001, 2004]);
    }

    #[test]
    fn test_rename_playlist_to_existing_title() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        assert!(matches!(
            ipod.rename_playlist("Favorites", "Quiet"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(ipod.playlist_by_title("Favorites").is_some());
    }

    #[test]
    fn test_operations_require_open_device() {
        let mut ipod = IPod::new();
        assert!(!ipod.is_open());
        assert!(matches!(ipod.create_playlist("x"), Err(Error::NotOpen)));
        assert!(matches!(ipod.delete_track(1), Err(Error::NotOpen)));
        assert!(matches!(ipod.create_new_track_metadata(), Err(Error::NotOpen)));
        assert!(matches!(ipod.write_itunes_db(), Err(Error::NotOpen)));
        assert!(matches!(ipod.replay_log(), Err(Error::NotOpen)));
    }

    #[test]
    fn test_failed_open_is_retryable() {
        let device = create_device(&minimal_source());
        let db = device.path().join(ITUNESDB_PATH);
        let good = fs::read(&db).unwrap();
        fs::write(&db, b"mhzz").unwrap();

        let mut ipod = IPod::new();
        assert!(ipod.open(device.path()).is_err());
        assert!(!ipod.is_open());

        fs::write(&db, good).unwrap();
        ipod.open(device.path()).unwrap();
        assert!(ipod.track_by_id(2001).is_some());
    }

    #[test]
    fn test_new_track_metadata_is_not_reserved() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());

        let first = ipod.create_new_track_metadata().unwrap();
        let second = ipod.create_new_track_metadata().unwrap();
        assert_eq!(first.id, 2005);
        assert_eq!(first.id, second.id);
        assert_eq!(first.path(), ":iPod_Control:Music:F05:kpod2005");
        assert!(first.date_added > 0);
        assert_ne!(first.dbid, 0);

        let mut track = first;
        track.set_artist("Low");
        track.set_album("Trust");
        track.set_title("Canada");
        ipod.add_track(track).unwrap();
        assert_eq!(ipod.create_new_track_metadata().unwrap().id, 2006);

        // a second add with the stale id is refused
        assert!(matches!(ipod.add_track(second), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_new_track_metadata_after_delete() {
        let device = create_device(&minimal_source());
        let mut ipod = open(device.path());
        ipod.add_track(track(2003, "a", "b", "c")).unwrap();
        ipod.delete_track(2003).unwrap();
        ipod.add_track(track(2002, "a", "b", "c")).unwrap();

        // max id stays at 2003 after the delete, 2004 is the next free one
        assert_eq!(ipod.create_new_track_metadata().unwrap().id, 2004);
    }

    #[test]
    fn test_delete_track_cross_index_consistency() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        ipod.add_track_to_playlist(2002, "Favorites").unwrap();

        ipod.delete_track(2002).unwrap();

        let db = ipod.database();
        assert!(db.track_by_id(2002).is_none());
        for artist in db.artists() {
            for album in db.artist_by_name(artist).unwrap().values() {
                assert!(!album.contains(2002));
            }
        }
        for title in db.playlist_titles() {
            assert!(!db.playlist_by_title(title).unwrap().contains(2002));
        }
        assert!(!db.main_playlist().contains(2002));

        assert!(matches!(ipod.delete_track(2002), Err(Error::DoesNotExist(_))));
    }

    #[test]
    fn test_playlist_membership() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());

        ipod.create_playlist("Road").unwrap();
        assert!(matches!(ipod.create_playlist("Road"), Err(Error::AlreadyExists(_))));
        ipod.add_track_to_playlist(2004, "Road").unwrap();
        ipod.add_track_to_playlist(2002, "Road").unwrap();
        ipod.add_track_to_playlist(2004, "Road").unwrap();
        assert!(matches!(
            ipod.add_track_to_playlist(9999, "Road"),
            Err(Error::DoesNotExist(_))
        ));
        assert!(matches!(
            ipod.add_track_to_playlist(2004, "Nope"),
            Err(Error::DoesNotExist(_))
        ));

        ipod.remove_from_playlist(0, "Road").unwrap();
        let road = ipod.playlist_by_title("Road").unwrap();
        assert_eq!(road.entries(), &[LISTITEM_DELETED, 2002, 2004]);
        assert!(matches!(
            ipod.remove_from_playlist(3, "Road"),
            Err(Error::DoesNotExist(_))
        ));

        ipod.delete_playlist("Road").unwrap();
        assert!(matches!(ipod.delete_playlist("Road"), Err(Error::DoesNotExist(_))));
    }

    #[test]
    fn test_delete_artist() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());

        assert!(matches!(ipod.delete_artist("Low"), Err(Error::NotEmpty(_))));
        assert!(matches!(ipod.delete_artist("Nobody"), Err(Error::DoesNotExist(_))));

        ipod.delete_album("AC/DC", "Back in Black").unwrap();
        ipod.delete_artist("AC/DC").unwrap();
        assert!(!ipod.artists().contains(&"AC%2fDC".to_string()));
    }

    #[test]
    fn test_name_defaults_and_rename() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        assert_eq!(ipod.name(), "Sam's iPod");

        ipod.set_name("Road iPod").unwrap();
        ipod.write_itunes_db().unwrap();

        let reopened = open(device.path());
        assert_eq!(reopened.name(), "Road iPod");
    }

    #[test]
    fn test_write_persists_and_flushes_log() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        ipod.create_playlist("Road").unwrap();
        ipod.add_track_to_playlist(2003, "Road").unwrap();
        let old_log = log_file_path(device.path(), ipod.snapshot().mtime.unwrap());
        assert!(old_log.exists());
        assert!(ipod.has_pending_changes());

        ipod.write_itunes_db().unwrap();
        assert!(!old_log.exists());
        assert!(!ipod.has_pending_changes());
        assert_eq!(ipod.snapshot().cursor, 0);
        assert!(ipod.is_still_connected());

        let reopened = open(device.path());
        assert_eq!(reopened.playlist_by_title("Road").unwrap().entries(), &[2003]);
    }

    #[test]
    fn test_replay_brings_peer_up_to_date() {
        let device = create_device(&library_source());
        let mut writer = open(device.path());
        let mut reader = open(device.path());
        let pristine = open(device.path());

        let mut new_track = writer.create_new_track_metadata().unwrap();
        new_track.set_artist("Low");
        new_track.set_album("Trust");
        new_track.set_title("Canada");
        let new_id = new_track.id;

        writer.create_playlist("Road").unwrap();
        writer.add_track(new_track).unwrap();
        writer.add_track_to_playlist(new_id, "Road").unwrap();
        writer.add_track_to_playlist(2002, "Road").unwrap();
        writer.remove_from_playlist(1, "Road").unwrap();
        writer.rename_album("AC/DC", "Back in Black", "AC/DC", "Black").unwrap();
        writer.move_track(2003, "Low", "Trust").unwrap();
        writer.delete_track(2001).unwrap();
        writer.rename_playlist("Quiet", "Hush").unwrap();
        assert_eq!(writer.snapshot().cursor, 9);

        assert!(reader.ensure_consistency().unwrap());
        assert_eq!(reader.snapshot().cursor, 9);

        let writer_db = writer.database();
        let reader_db = reader.database();
        assert_eq!(
            writer_db.tracks().collect::<Vec<_>>(),
            reader_db.tracks().collect::<Vec<_>>()
        );
        for title in writer_db.playlist_titles() {
            assert_eq!(
                writer_db.playlist_by_title(title).unwrap().entries(),
                reader_db.playlist_by_title(title).unwrap().entries()
            );
        }
        assert_eq!(writer.artists(), reader.artists());
        assert_eq!(
            writer.album("Low", "Trust").unwrap().entries(),
            reader.album("Low", "Trust").unwrap().entries()
        );
        assert_eq!(
            writer_db.main_playlist().entries(),
            reader_db.main_playlist().entries()
        );

        // cursor at the end: nothing happens
        assert_eq!(reader.replay_log().unwrap(), 0);
        // the writer's own entries are never replayed onto itself
        assert_eq!(writer.replay_log().unwrap(), 0);
        // untouched session still sees the original state until it catches up
        assert!(pristine.track_by_id(2001).is_some());
    }

    #[test]
    fn test_replay_tolerates_truncated_tail() {
        let device = create_device(&library_source());
        let mut writer = open(device.path());
        let mut reader = open(device.path());

        writer.create_playlist("One").unwrap();
        writer.create_playlist("Two").unwrap();
        let log = log_file_path(device.path(), writer.snapshot().mtime.unwrap());
        let data = fs::read(&log).unwrap();
        fs::write(&log, &data[..data.len() - 2]).unwrap();

        assert!(reader.ensure_consistency().unwrap());
        assert!(reader.playlist_by_title("One").is_some());
        assert!(reader.playlist_by_title("Two").is_none());
        assert_eq!(reader.snapshot().cursor, 1);
    }

    #[test]
    fn test_interleaved_sessions_see_each_other() {
        let device = create_device(&library_source());
        let mut a = open(device.path());
        let mut b = open(device.path());

        a.create_playlist("FromA").unwrap();
        b.create_playlist("FromB").unwrap();
        // b caught up on a's entry before logging its own
        assert!(b.playlist_by_title("FromA").is_some());
        assert_eq!(b.snapshot().cursor, 2);

        assert!(a.ensure_consistency().unwrap());
        assert!(b.ensure_consistency().unwrap());
        assert!(a.playlist_by_title("FromB").is_some());
        assert_eq!(a.snapshot().cursor, 2);
        assert_eq!(a.playlist_titles(), b.playlist_titles());

        a.create_playlist("Same").unwrap();
        assert!(matches!(b.create_playlist("Same"), Err(Error::AlreadyExists(_))));
        assert_eq!(b.snapshot().cursor, 3);
        assert!(a.ensure_consistency().unwrap());
        assert_eq!(a.snapshot().cursor, 3);
        assert_eq!(a.playlist_titles(), b.playlist_titles());
    }

    #[test]
    fn test_failed_logging_leaves_index_unchanged() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        fs::remove_file(device.path().join(ITUNESDB_PATH)).unwrap();

        assert!(ipod.create_playlist("Ghost").is_err());
        assert!(ipod.playlist_by_title("Ghost").is_none());
        assert!(ipod.delete_track(2001).is_err());
        assert!(ipod.track_by_id(2001).is_some());
        assert!(!ipod.has_pending_changes());
    }

    #[test]
    fn test_partial_log_entry_blocks_logging() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        ipod.create_playlist("One").unwrap();
        ipod.create_playlist("Two").unwrap();
        let log = log_file_path(device.path(), ipod.snapshot().mtime.unwrap());
        let data = fs::read(&log).unwrap();
        fs::write(&log, &data[..data.len() - 2]).unwrap();

        let result = ipod.create_playlist("Three");
        assert!(matches!(result, Err(Error::Log(_))));
        assert!(ipod.playlist_by_title("Three").is_none());
        assert_eq!(fs::read(&log).unwrap().len(), data.len() - 2);
    }

    #[test]
    fn test_new_track_metadata_when_ids_run_out() {
        let mut source = FixtureSource::new("iPod");
        source.add_track(track(u32::MAX, "Low", "Trust", "Canada"));
        let device = create_device(&source);
        let ipod = open(device.path());

        assert_eq!(ipod.database().max_track_id(), u32::MAX);
        assert!(matches!(
            ipod.create_new_track_metadata(),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_failed_playlist_edit_stays_clean() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        assert!(!ipod.database().is_changed());

        assert!(matches!(
            ipod.remove_from_playlist(99, "Quiet"),
            Err(Error::DoesNotExist(_))
        ));
        assert!(!ipod.database().is_changed());
        assert!(!ipod.has_pending_changes());

        ipod.remove_from_playlist(0, "Quiet").unwrap();
        assert!(ipod.database().is_changed());
    }

    #[test]
    fn test_changed_database_discards_log() {
        let device = create_device(&library_source());
        let mut ipod = open(device.path());
        ipod.create_playlist("Road").unwrap();
        let log = log_file_path(device.path(), ipod.snapshot().mtime.unwrap());
        assert!(log.exists());

        // another process rewrote the database
        let db = device.path().join(ITUNESDB_PATH);
        let later = SystemTime::now() + Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&db)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(!ipod.is_still_connected());
        assert!(!ipod.ensure_consistency().unwrap());
        assert!(!log.exists());
        assert_eq!(ipod.snapshot().cursor, 0);

        // reopening picks up the device state without the discarded entry
        ipod.open(device.path()).unwrap();
        assert!(ipod.playlist_by_title("Road").is_none());
        assert!(ipod.ensure_consistency().unwrap());
    }

    #[test]
    fn test_explicit_lock_is_reused_by_logging() {
        let device = create_device(&minimal_source());
        let mut ipod = open(device.path());
        ipod.lock(true).unwrap();
        assert!(ipod.is_locked());
        ipod.create_playlist("Locked").unwrap();
        ipod.replay_log().unwrap();
        ipod.unlock().unwrap();
        assert!(!ipod.is_locked());
    }

    #[test]
    fn test_close_discards_state() {
        let device = create_device(&minimal_source());
        let mut ipod = open(device.path());
        ipod.create_playlist("Road").unwrap();
        let log = log_file_path(device.path(), ipod.snapshot().mtime.unwrap());

        ipod.close().unwrap();
        assert!(!ipod.is_open());
        assert!(!log.exists());
        assert!(ipod.track_by_id(2001).is_none());
    }
}
