//! Generic property bag shared by every on-device record
//!
//! Keys are the `mhod` type codes, values are the decoded strings. A missing
//! property reads as the empty string.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// String property types as stored in `mhod` blocks
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemProperty {
    Title = 1,
    Path = 2,
    Album = 3,
    Artist = 4,
    Genre = 5,
    FileType = 6,
    EqSetting = 7,
    Comment = 8,
    Category = 9,
    Composer = 12,
    Grouping = 13,
    Description = 14,
}

/// `mhod` type that carries a playlist position instead of a string
pub const MHOD_PLAYLIST_POSITION: u32 = 100;

impl ItemProperty {
    /// Map a raw `mhod` type to a string property, `None` for anything that
    /// must not be stored (playlist back references, smart playlist data, ...)
    pub fn from_mhod_type(kind: u32) -> Option<Self> {
        match kind {
            1 => Some(Self::Title),
            2 => Some(Self::Path),
            3 => Some(Self::Album),
            4 => Some(Self::Artist),
            5 => Some(Self::Genre),
            6 => Some(Self::FileType),
            7 => Some(Self::EqSetting),
            8 => Some(Self::Comment),
            9 => Some(Self::Category),
            12 => Some(Self::Composer),
            13 => Some(Self::Grouping),
            14 => Some(Self::Description),
            _ => None,
        }
    }

    pub fn mhod_type(self) -> u32 {
        self as u32
    }
}

/// Tagged key/value store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    properties: BTreeMap<ItemProperty, String>,
}

impl ListItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a property, empty if unset
    pub fn get(&self, property: ItemProperty) -> &str {
        self.properties.get(&property).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, property: ItemProperty, value: impl Into<String>) {
        self.properties.insert(property, value.into());
    }

    pub fn remove(&mut self, property: ItemProperty) -> Option<String> {
        self.properties.remove(&property)
    }

    pub fn contains(&self, property: ItemProperty) -> bool {
        self.properties.contains_key(&property)
    }

    /// Non-empty properties in type order
    pub fn iter(&self) -> impl Iterator<Item = (ItemProperty, &str)> {
        self.properties
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(property, value)| (*property, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
