//! iTunesDB structure validation
//!
//! Walks the block tree of a database image without building an index and
//! reports structural problems. Errors make the file unreadable for the
//! parser or for the device; warnings are inconsistencies the parser
//! tolerates.

use std::collections::HashSet;

use crate::block::{
    le_u32, tag_name, BlockPrefix, BLOCK_PREFIX_LEN, MHBD, MHIP, MHIT, MHLP, MHLT, MHOD, MHSD,
    MHYP, SECTION_PLAYLISTS, SECTION_TRACKS,
};
use crate::track::HeaderLayout;

/// Counts collected while walking the file
#[derive(Debug, Default, Clone)]
pub struct ItunesDbStats {
    pub total_bytes: usize,
    pub sections: u32,
    pub tracks: u32,
    pub playlists: u32,
    pub playlist_items: u32,
    /// `mhod` blocks of any kind
    pub properties: u32,
}

/// Validation result with details
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub stats: ItunesDbStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            valid: true,
            stats: ItunesDbStats::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn add_error(&mut self, msg: String) {
        self.valid = false;
        self.errors.push(msg);
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }
}

/// A block whose prefix and extent were checked against its parent
struct Block {
    prefix: BlockPrefix,
    start: usize,
    end: usize,
}

impl Block {
    fn body_start(&self) -> usize {
        self.start + self.prefix.header_len as usize
    }
}

/// Validate an iTunesDB image
pub fn validate_itunesdb(data: &[u8]) -> ValidationResult {
    let mut result = ValidationResult::new();
    result.stats.total_bytes = data.len();

    let Some(header) = BlockPrefix::read(data, 0) else {
        result.add_error(format!("File too small: {} bytes", data.len()));
        return result;
    };
    if &header.tag != MHBD {
        result.add_error(format!(
            "Bad magic: expected 'mhbd', found '{}'",
            tag_name(&header.tag)
        ));
        return result;
    }

    let header_len = header.header_len as usize;
    if header_len < 0x18 || header_len > data.len() {
        result.add_error(format!("Invalid mhbd header length {}", header.header_len));
        return result;
    }

    // The file header is the only block whose declared length must match
    // the data exactly
    let total_len = header.length_or_count as usize;
    if total_len != data.len() {
        result.add_error(format!(
            "Size mismatch: mhbd declares {} bytes, file has {}",
            total_len,
            data.len()
        ));
    }
    let end = total_len.min(data.len());

    let declared_sections = le_u32(data, 0x14);
    let mut track_ids = HashSet::new();

    let mut pos = header_len;
    while pos < end {
        let Some(section) = read_block(data, pos, end, &mut result) else {
            break;
        };
        if &section.prefix.tag != MHSD {
            result.add_error(format!(
                "Unknown tag '{}' at offset {:#x}, expected mhsd",
                tag_name(&section.prefix.tag),
                pos
            ));
            break;
        }
        result.stats.sections += 1;

        let kind = if section.prefix.header_len >= 16 {
            le_u32(data, pos + 0x0C)
        } else {
            0
        };
        match kind {
            SECTION_TRACKS => validate_track_section(data, &section, &mut track_ids, &mut result),
            SECTION_PLAYLISTS => validate_playlist_section(data, &section, &track_ids, &mut result),
            other => result.add_warning(format!(
                "Section at offset {:#x} has kind {}, contents not checked",
                pos, other
            )),
        }
        pos = section.end;
    }

    if result.stats.sections != declared_sections {
        result.add_warning(format!(
            "mhbd declares {} sections, found {}",
            declared_sections, result.stats.sections
        ));
    }

    result
}

/// Read the block at `pos` and check that it fits inside `[pos, limit)`
fn read_block(
    data: &[u8],
    pos: usize,
    limit: usize,
    result: &mut ValidationResult,
) -> Option<Block> {
    let Some(prefix) = BlockPrefix::read(data, pos).filter(|_| pos + BLOCK_PREFIX_LEN <= limit)
    else {
        result.add_error(format!("Truncated block at offset {:#x}", pos));
        return None;
    };

    let header_len = prefix.header_len as usize;
    if header_len < BLOCK_PREFIX_LEN || pos + header_len > limit {
        result.add_error(format!(
            "Block '{}' at offset {:#x}: header length {} does not fit",
            tag_name(&prefix.tag),
            pos,
            header_len
        ));
        return None;
    }

    // list headers carry a child count instead of a length
    let end = if &prefix.tag == MHLT || &prefix.tag == MHLP {
        pos + header_len
    } else {
        let total_len = prefix.length_or_count as usize;
        if total_len < header_len {
            result.add_error(format!(
                "Block '{}' at offset {:#x}: total length {} smaller than header {}",
                tag_name(&prefix.tag),
                pos,
                total_len,
                header_len
            ));
            return None;
        }
        if pos + total_len > limit {
            result.add_error(format!(
                "Block '{}' at offset {:#x} is truncated: needs {} bytes, {} left",
                tag_name(&prefix.tag),
                pos,
                total_len,
                limit - pos
            ));
            return None;
        }
        pos + total_len
    };

    Some(Block {
        prefix,
        start: pos,
        end,
    })
}

fn validate_track_section(
    data: &[u8],
    section: &Block,
    track_ids: &mut HashSet<u32>,
    result: &mut ValidationResult,
) {
    let mut pos = section.body_start();
    let Some(list) = read_block(data, pos, section.end, result) else {
        return;
    };
    if &list.prefix.tag != MHLT {
        result.add_error(format!(
            "Track section at offset {:#x} starts with '{}' instead of mhlt",
            section.start,
            tag_name(&list.prefix.tag)
        ));
        return;
    }
    let declared = list.prefix.length_or_count;
    pos = list.end;

    let mut found = 0u32;
    while pos < section.end {
        let Some(block) = read_block(data, pos, section.end, result) else {
            return;
        };
        if &block.prefix.tag != MHIT {
            result.add_error(format!(
                "Unknown tag '{}' at offset {:#x} in track section",
                tag_name(&block.prefix.tag),
                pos
            ));
            return;
        }

        let header_len = block.prefix.header_len as usize;
        if header_len != HeaderLayout::Itunes47.header_len()
            && header_len != HeaderLayout::Itunes49.header_len()
        {
            result.add_warning(format!(
                "Track at offset {:#x} has unusual header length {:#x}",
                pos, header_len
            ));
        }
        if header_len < 0x14 {
            result.add_error(format!("Track at offset {:#x} has no id", pos));
            return;
        }

        let track_id = le_u32(data, pos + 0x10);
        if !track_ids.insert(track_id) {
            result.add_warning(format!("Duplicate track id {}", track_id));
        }

        let declared_mhods = le_u32(data, pos + 0x0C);
        let mhods = count_properties(data, &block, result);
        if mhods != declared_mhods {
            result.add_warning(format!(
                "Track {} declares {} mhods, found {}",
                track_id, declared_mhods, mhods
            ));
        }

        found += 1;
        pos = block.end;
    }

    result.stats.tracks += found;
    if found != declared {
        result.add_warning(format!("mhlt declares {} tracks, found {}", declared, found));
    }
}

fn validate_playlist_section(
    data: &[u8],
    section: &Block,
    track_ids: &HashSet<u32>,
    result: &mut ValidationResult,
) {
    let mut pos = section.body_start();
    let Some(list) = read_block(data, pos, section.end, result) else {
        return;
    };
    if &list.prefix.tag != MHLP {
        result.add_error(format!(
            "Playlist section at offset {:#x} starts with '{}' instead of mhlp",
            section.start,
            tag_name(&list.prefix.tag)
        ));
        return;
    }
    let declared = list.prefix.length_or_count;
    pos = list.end;

    let mut found = 0u32;
    while pos < section.end {
        let Some(block) = read_block(data, pos, section.end, result) else {
            return;
        };
        if &block.prefix.tag != MHYP {
            result.add_error(format!(
                "Unknown tag '{}' at offset {:#x} in playlist section",
                tag_name(&block.prefix.tag),
                pos
            ));
            return;
        }
        if block.prefix.header_len < 0x18 {
            result.add_error(format!("Playlist at offset {:#x} has a short header", pos));
            return;
        }

        let main_flag = le_u32(data, pos + 0x14);
        if found == 0 && main_flag == 0 {
            result.add_warning(format!(
                "First playlist at offset {:#x} is not flagged as main playlist",
                pos
            ));
        } else if found > 0 && main_flag != 0 {
            result.add_warning(format!("Extra main playlist at offset {:#x}", pos));
        }

        validate_playlist(data, &block, found == 0, track_ids, result);
        found += 1;
        pos = block.end;
    }

    result.stats.playlists += found;
    if found != declared {
        result.add_warning(format!(
            "mhlp declares {} playlists, found {}",
            declared, found
        ));
    }
}

fn validate_playlist(
    data: &[u8],
    playlist: &Block,
    main: bool,
    track_ids: &HashSet<u32>,
    result: &mut ValidationResult,
) {
    let declared_mhods = le_u32(data, playlist.start + 0x0C);
    let declared_items = le_u32(data, playlist.start + 0x10);

    let mut mhods = 0u32;
    let mut items = 0u32;
    let mut pos = playlist.body_start();
    while pos < playlist.end {
        let Some(block) = read_block(data, pos, playlist.end, result) else {
            return;
        };
        match &block.prefix.tag {
            tag if tag == MHOD => {
                mhods += 1;
                result.stats.properties += 1;
            }
            tag if tag == MHIP => {
                if block.prefix.header_len < 0x1C {
                    result.add_error(format!("Playlist item at offset {:#x} has a short header", pos));
                    return;
                }
                let track_id = le_u32(data, pos + 0x18);
                if !track_ids.contains(&track_id) {
                    result.add_warning(format!(
                        "Playlist {}item at offset {:#x} references unknown track {}",
                        if main { "main " } else { "" },
                        pos,
                        track_id
                    ));
                }
                count_properties(data, &block, result);
                items += 1;
            }
            tag => {
                result.add_error(format!(
                    "Unknown tag '{}' at offset {:#x} in playlist",
                    tag_name(tag),
                    pos
                ));
                return;
            }
        }
        pos = block.end;
    }

    result.stats.playlist_items += items;
    if mhods != declared_mhods {
        result.add_warning(format!(
            "Playlist at offset {:#x} declares {} mhods, found {}",
            playlist.start, declared_mhods, mhods
        ));
    }
    if items != declared_items {
        result.add_warning(format!(
            "Playlist at offset {:#x} declares {} items, found {}",
            playlist.start, declared_items, items
        ));
    }
}

/// Count the `mhod` children of a record, reporting anything else
fn count_properties(data: &[u8], record: &Block, result: &mut ValidationResult) -> u32 {
    let mut count = 0;
    let mut pos = record.body_start();
    while pos < record.end {
        let Some(block) = read_block(data, pos, record.end, result) else {
            break;
        };
        if &block.prefix.tag != MHOD {
            result.add_error(format!(
                "Unknown tag '{}' at offset {:#x}, expected mhod",
                tag_name(&block.prefix.tag),
                pos
            ));
            break;
        }
        count += 1;
        pos = block.end;
    }
    result.stats.properties += count;
    count
}

/// Validate an iTunesDB image and print results to stdout
pub fn validate_and_print(data: &[u8]) -> bool {
    let result = validate_itunesdb(data);

    println!("iTunesDB Validation Results");
    println!("===========================");
    println!();

    println!("Status: {}", if result.valid { "VALID" } else { "INVALID" });
    println!();

    println!("Statistics:");
    println!("  Size: {} bytes", result.stats.total_bytes);
    println!("  Sections: {}", result.stats.sections);
    println!("  Tracks: {}", result.stats.tracks);
    println!("  Playlists: {}", result.stats.playlists);
    println!("  Playlist items: {}", result.stats.playlist_items);
    println!("  Properties: {}", result.stats.properties);
    println!();

    if !result.errors.is_empty() {
        println!("Errors:");
        for err in &result.errors {
            println!("  - {}", err);
        }
        println!();
    }

    if !result.warnings.is_empty() {
        println!("Warnings:");
        for warn in &result.warnings {
            println!("  - {}", warn);
        }
        println!();
    }

    result.valid
}
