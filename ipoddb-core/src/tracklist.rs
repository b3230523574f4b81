//! Ordered track-id lists used for albums and playlists

use serde::{Deserialize, Serialize};

/// Marker written over a removed playlist position
pub const LISTITEM_DELETED: u32 = 0;

/// A titled, ordered sequence of track ids
///
/// Albums and playlists share this type. The playlist header fields are only
/// meaningful for playlists and are carried through a parse/write cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackList {
    title: String,
    track_ids: Vec<u32>,
    max_track_number: u32,
    #[serde(skip)]
    changed: bool,
    /// Set on the device playlist
    pub main: bool,
    pub playlist_id: u64,
    pub timestamp: u32,
    pub sort_order: u32,
}

impl TrackList {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.changed = true;
    }

    /// Append a track id, returns its 1-based position
    pub fn add_playlist_item(&mut self, track_id: u32) -> u32 {
        self.track_ids.push(track_id);
        self.changed = true;
        self.track_ids.len() as u32
    }

    /// All entries including deleted markers
    pub fn entries(&self) -> &[u32] {
        &self.track_ids
    }

    /// Live track ids in order
    pub fn track_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.track_ids
            .iter()
            .copied()
            .filter(|&id| id != LISTITEM_DELETED)
    }

    pub fn num_tracks(&self) -> usize {
        self.track_ids().count()
    }

    pub fn is_empty(&self) -> bool {
        self.num_tracks() == 0
    }

    pub fn contains(&self, track_id: u32) -> bool {
        track_id != LISTITEM_DELETED && self.track_ids.contains(&track_id)
    }

    /// Remove every occurrence of a track id, returns how many were removed
    pub fn remove_all(&mut self, track_id: u32) -> usize {
        let before = self.track_ids.len();
        self.track_ids.retain(|&id| id != track_id);
        let removed = before - self.track_ids.len();
        if removed > 0 {
            self.changed = true;
        }
        removed
    }

    /// Keep only the ids accepted by `keep`, returns how many were dropped
    pub fn retain(&mut self, mut keep: impl FnMut(u32) -> bool) -> usize {
        let before = self.track_ids.len();
        self.track_ids.retain(|&id| keep(id));
        let removed = before - self.track_ids.len();
        if removed > 0 {
            self.changed = true;
        }
        removed
    }

    /// Overwrite the id at a 0-based position, `false` if out of range
    pub fn set_track_id_at(&mut self, position: usize, track_id: u32) -> bool {
        match self.track_ids.get_mut(position) {
            Some(slot) => {
                *slot = track_id;
                self.changed = true;
                true
            }
            None => false,
        }
    }

    /// Drop deleted markers before the list is serialized
    pub fn purge_deleted(&mut self) -> usize {
        self.remove_all(LISTITEM_DELETED)
    }

    pub fn max_track_number(&self) -> u32 {
        self.max_track_number
    }

    pub fn set_max_track_number(&mut self, number: u32) {
        self.max_track_number = number;
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_and_duplicates() {
        let mut list = TrackList::new("Mix");
        assert_eq!(list.add_playlist_item(10), 1);
        assert_eq!(list.add_playlist_item(11), 2);
        assert_eq!(list.add_playlist_item(10), 3);

        assert_eq!(list.remove_all(10), 2);
        assert_eq!(list.entries(), &[11]);
        assert!(list.is_changed());
    }

    #[test]
    fn test_deleted_marker_keeps_positions_stable() {
        let mut list = TrackList::new("Mix");
        for id in [1, 2, 3] {
            list.add_playlist_item(id);
        }
        assert!(list.set_track_id_at(0, LISTITEM_DELETED));
        assert!(!list.set_track_id_at(3, LISTITEM_DELETED));

        // position 2 still addresses track 3
        assert_eq!(list.entries()[2], 3);
        assert_eq!(list.track_ids().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(list.num_tracks(), 2);
        assert!(!list.contains(LISTITEM_DELETED));

        assert_eq!(list.purge_deleted(), 1);
        assert_eq!(list.entries(), &[2, 3]);
    }
}
