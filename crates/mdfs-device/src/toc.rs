//! UTOC sector codec.
//!
//! Sector 0 carries the track map and fragment chains, sector 1 the title
//! store. Layout (offsets within a 2352-byte sector):
//!
//! ```text
//! sector 0: 0x000  16-byte header, track count at 0x0C
//!           0x010  track map, 256 bytes; slot 0 = free chain, slot i =
//!                  first fragment of track i (1-based)
//!           0x110  fragment table, 256 slots × 8 bytes:
//!                  start(3) mode(1) end(3) link(1); link 0 terminates
//! sector 1: 0x000  16-byte header
//!           0x010  title map, 256 bytes (slot i = first cell of track i)
//!           0x110  title cells, 256 × 8 bytes: 7 title bytes + link
//! ```
//!
//! Disc addresses pack cluster (14 bits), sector (6) and sound group (4)
//! into 3 bytes. A fragment's `end` address is exclusive, so the fragment
//! spans `logical(end) − logical(start)` sectors.

use mdfs_types::{ensure_slice, read_fixed, ParseError, TrackIndex, SECTOR_SIZE};

/// Fragment mode flag: SP-rate audio (cleared on MDLP tracks).
pub const F_SP_MODE: u8 = 0x40;
/// Fragment mode flag: stereo.
pub const F_STEREO: u8 = 0x20;
/// Fragment mode flag: host tools may rewrite this fragment.
pub const F_WRITABLE: u8 = 0x04;

/// Audio sectors per cluster.
pub const SECTORS_PER_CLUSTER: u32 = 32;

const HEADER_LEN: usize = 0x10;
const N_TRACKS_OFFSET: usize = 0x0C;
const TRACK_MAP_OFFSET: usize = 0x10;
const FRAGMENT_TABLE_OFFSET: usize = 0x110;
const TITLE_MAP_OFFSET: usize = 0x10;
const TITLE_CELL_OFFSET: usize = 0x110;
const SLOT_COUNT: usize = 256;
const TITLE_CHARS: usize = 7;

/// Physical disc address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscAddress {
    pub cluster: u16,
    pub sector: u8,
    pub group: u8,
}

impl DiscAddress {
    pub const ZERO: Self = Self {
        cluster: 0,
        sector: 0,
        group: 0,
    };

    #[must_use]
    pub fn encode(self) -> [u8; 3] {
        [
            (self.cluster >> 6) as u8,
            ((self.cluster as u8) << 2) | (self.sector >> 4),
            (self.sector << 4) | (self.group & 0x0F),
        ]
    }

    #[must_use]
    pub fn decode(bytes: [u8; 3]) -> Self {
        Self {
            cluster: (u16::from(bytes[0]) << 6) | u16::from(bytes[1] >> 2),
            sector: ((bytes[1] & 0x03) << 4) | (bytes[2] >> 4),
            group: bytes[2] & 0x0F,
        }
    }

    /// Logical sector number of this address.
    #[must_use]
    pub fn to_logical(self) -> u32 {
        u32::from(self.cluster) * SECTORS_PER_CLUSTER + u32::from(self.sector)
    }

    /// Address of a logical sector number (group 0).
    #[must_use]
    pub fn from_logical(logical: u32) -> Self {
        Self {
            cluster: (logical / SECTORS_PER_CLUSTER) as u16,
            sector: (logical % SECTORS_PER_CLUSTER) as u8,
            group: 0,
        }
    }
}

/// One fragment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub start: DiscAddress,
    pub mode: u8,
    pub end: DiscAddress,
    pub link: u8,
}

impl Fragment {
    pub const EMPTY: Self = Self {
        start: DiscAddress::ZERO,
        mode: 0,
        end: DiscAddress::ZERO,
        link: 0,
    };

    /// Sectors covered by this fragment (`end` exclusive).
    #[must_use]
    pub fn sector_span(&self) -> u32 {
        self.end.to_logical().saturating_sub(self.start.to_logical())
    }
}

/// One title cell: 7 NUL-padded bytes plus a link to the next cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TitleCell {
    pub chars: [u8; TITLE_CHARS],
    pub link: u8,
}

impl TitleCell {
    pub const EMPTY: Self = Self {
        chars: [0; TITLE_CHARS],
        link: 0,
    };
}

/// Parsed UTOC sectors 0 and 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toc {
    pub header0: [u8; HEADER_LEN],
    pub header1: [u8; HEADER_LEN],
    pub n_tracks: u8,
    pub track_map: [u8; SLOT_COUNT],
    pub fragments: [Fragment; SLOT_COUNT],
    pub title_map: [u8; SLOT_COUNT],
    pub title_cells: [TitleCell; SLOT_COUNT],
}

impl Toc {
    /// A blank TOC: no tracks, no fragments, no titles.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            header0: [0; HEADER_LEN],
            header1: [0; HEADER_LEN],
            n_tracks: 0,
            track_map: [0; SLOT_COUNT],
            fragments: [Fragment::EMPTY; SLOT_COUNT],
            title_map: [0; SLOT_COUNT],
            title_cells: [TitleCell::EMPTY; SLOT_COUNT],
        }
    }

    /// Fragment slot numbers of a track's chain, cycle-guarded.
    #[must_use]
    pub fn fragment_chain(&self, index: TrackIndex) -> Vec<u8> {
        let mut chain = Vec::new();
        let mut visited = [false; SLOT_COUNT];
        let Some(&head) = self.track_map.get(index.as_usize() + 1) else {
            return chain;
        };
        let mut slot = head;
        while slot != 0 && !visited[usize::from(slot)] {
            visited[usize::from(slot)] = true;
            chain.push(slot);
            slot = self.fragments[usize::from(slot)].link;
        }
        chain
    }

    /// Total sectors occupied by a track.
    #[must_use]
    pub fn track_sectors(&self, index: TrackIndex) -> u64 {
        self.fragment_chain(index)
            .iter()
            .map(|slot| u64::from(self.fragments[usize::from(*slot)].sector_span()))
            .sum()
    }

    /// Mode byte of the first fragment, if the track has one.
    #[must_use]
    pub fn first_fragment_mode(&self, index: TrackIndex) -> Option<u8> {
        self.fragment_chain(index)
            .first()
            .map(|slot| self.fragments[usize::from(*slot)].mode)
    }

    /// Set and clear mode bits on every fragment of a track's chain.
    pub fn stamp_fragment_modes(&mut self, index: TrackIndex, set: u8, clear: u8) {
        for slot in self.fragment_chain(index) {
            let fragment = &mut self.fragments[usize::from(slot)];
            fragment.mode = (fragment.mode | set) & !clear;
        }
    }

    /// Title of a track, assembled from its cell chain. `None` if untitled.
    #[must_use]
    pub fn title(&self, index: TrackIndex) -> Option<String> {
        let mut bytes = Vec::new();
        let mut visited = [false; SLOT_COUNT];
        let mut cell = *self.title_map.get(index.as_usize() + 1)?;
        while cell != 0 && !visited[usize::from(cell)] {
            visited[usize::from(cell)] = true;
            let entry = &self.title_cells[usize::from(cell)];
            bytes.extend_from_slice(&entry.chars);
            cell = entry.link;
        }
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        bytes.truncate(end);
        if bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&bytes).to_string())
        }
    }

    /// Append a track of `sectors` sectors with the given fragment mode.
    ///
    /// Allocates one fragment slot after the current allocation high-water
    /// mark and a title-cell chain. Returns the new track index, or `None`
    /// when the slot space is exhausted.
    pub fn add_track(&mut self, title: &str, sectors: u32, mode: u8) -> Option<TrackIndex> {
        if usize::from(self.n_tracks) + 1 >= SLOT_COUNT {
            return None;
        }
        let slot = self.free_fragment_slot()?;
        let start_cluster = self.allocation_highwater().div_ceil(SECTORS_PER_CLUSTER);
        let start = DiscAddress::from_logical(start_cluster * SECTORS_PER_CLUSTER);
        let end = DiscAddress::from_logical(start.to_logical() + sectors);
        self.fragments[usize::from(slot)] = Fragment {
            start,
            mode,
            end,
            link: 0,
        };
        self.n_tracks += 1;
        self.header0[N_TRACKS_OFFSET] = self.n_tracks;
        let track_no = usize::from(self.n_tracks);
        self.track_map[track_no] = slot;
        self.write_title(track_no, title);
        Some(TrackIndex(u16::from(self.n_tracks) - 1))
    }

    /// Remove a track, renumbering all later tracks down by one.
    pub fn remove_track(&mut self, index: TrackIndex) -> bool {
        let track_no = index.as_usize() + 1;
        if track_no > usize::from(self.n_tracks) {
            return false;
        }
        for slot in self.fragment_chain(index) {
            self.fragments[usize::from(slot)] = Fragment::EMPTY;
        }
        self.clear_title(track_no);
        for no in track_no..usize::from(self.n_tracks) {
            self.track_map[no] = self.track_map[no + 1];
            self.title_map[no] = self.title_map[no + 1];
        }
        self.track_map[usize::from(self.n_tracks)] = 0;
        self.title_map[usize::from(self.n_tracks)] = 0;
        self.n_tracks -= 1;
        self.header0[N_TRACKS_OFFSET] = self.n_tracks;
        true
    }

    fn free_fragment_slot(&self) -> Option<u8> {
        let mut used = [false; SLOT_COUNT];
        for no in 1..=usize::from(self.n_tracks) {
            for slot in self.fragment_chain(TrackIndex(no as u16 - 1)) {
                used[usize::from(slot)] = true;
            }
        }
        (1..SLOT_COUNT).find(|slot| !used[*slot]).map(|slot| slot as u8)
    }

    fn allocation_highwater(&self) -> u32 {
        self.fragments
            .iter()
            .map(|fragment| fragment.end.to_logical())
            .max()
            .unwrap_or(0)
    }

    fn write_title(&mut self, track_no: usize, title: &str) {
        self.clear_title(track_no);
        if title.is_empty() {
            return;
        }
        let mut used = [false; SLOT_COUNT];
        for no in 1..SLOT_COUNT {
            let mut cell = self.title_map[no];
            while cell != 0 && !used[usize::from(cell)] {
                used[usize::from(cell)] = true;
                cell = self.title_cells[usize::from(cell)].link;
            }
        }
        let mut prev: Option<u8> = None;
        for chunk in title.as_bytes().chunks(TITLE_CHARS) {
            let Some(cell) = (1..SLOT_COUNT).find(|c| !used[*c]) else {
                break;
            };
            used[cell] = true;
            let mut chars = [0_u8; TITLE_CHARS];
            chars[..chunk.len()].copy_from_slice(chunk);
            self.title_cells[cell] = TitleCell { chars, link: 0 };
            match prev {
                None => self.title_map[track_no] = cell as u8,
                Some(prev_cell) => self.title_cells[usize::from(prev_cell)].link = cell as u8,
            }
            prev = Some(cell as u8);
        }
    }

    fn clear_title(&mut self, track_no: usize) {
        let mut visited = [false; SLOT_COUNT];
        let mut cell = self.title_map[track_no];
        while cell != 0 && !visited[usize::from(cell)] {
            visited[usize::from(cell)] = true;
            let next = self.title_cells[usize::from(cell)].link;
            self.title_cells[usize::from(cell)] = TitleCell::EMPTY;
            cell = next;
        }
        self.title_map[track_no] = 0;
    }
}

/// Parse UTOC sectors 0 and 1.
pub fn parse_toc(sector0: &[u8], sector1: &[u8]) -> Result<Toc, ParseError> {
    for sector in [sector0, sector1] {
        if sector.len() < SECTOR_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SECTOR_SIZE,
                offset: 0,
                actual: sector.len(),
            });
        }
    }

    let header0 = read_fixed::<HEADER_LEN>(sector0, 0)?;
    let header1 = read_fixed::<HEADER_LEN>(sector1, 0)?;
    let n_tracks = header0[N_TRACKS_OFFSET];
    let track_map = read_fixed::<SLOT_COUNT>(sector0, TRACK_MAP_OFFSET)?;
    let title_map = read_fixed::<SLOT_COUNT>(sector1, TITLE_MAP_OFFSET)?;

    let mut fragments = [Fragment::EMPTY; SLOT_COUNT];
    for (slot, fragment) in fragments.iter_mut().enumerate() {
        let base = FRAGMENT_TABLE_OFFSET + slot * 8;
        let raw = ensure_slice(sector0, base, 8)?;
        *fragment = Fragment {
            start: DiscAddress::decode([raw[0], raw[1], raw[2]]),
            mode: raw[3],
            end: DiscAddress::decode([raw[4], raw[5], raw[6]]),
            link: raw[7],
        };
    }

    let mut title_cells = [TitleCell::EMPTY; SLOT_COUNT];
    for (slot, cell) in title_cells.iter_mut().enumerate() {
        let base = TITLE_CELL_OFFSET + slot * 8;
        let raw = ensure_slice(sector1, base, 8)?;
        let mut chars = [0_u8; TITLE_CHARS];
        chars.copy_from_slice(&raw[..TITLE_CHARS]);
        *cell = TitleCell {
            chars,
            link: raw[TITLE_CHARS],
        };
    }

    Ok(Toc {
        header0,
        header1,
        n_tracks,
        track_map,
        fragments,
        title_map,
        title_cells,
    })
}

/// Re-emit UTOC sectors 0 and 1 from a parsed TOC.
#[must_use]
pub fn reconstruct_toc(toc: &Toc) -> [Vec<u8>; 2] {
    let mut sector0 = vec![0_u8; SECTOR_SIZE];
    let mut sector1 = vec![0_u8; SECTOR_SIZE];

    sector0[..HEADER_LEN].copy_from_slice(&toc.header0);
    sector0[N_TRACKS_OFFSET] = toc.n_tracks;
    sector0[TRACK_MAP_OFFSET..TRACK_MAP_OFFSET + SLOT_COUNT].copy_from_slice(&toc.track_map);
    for (slot, fragment) in toc.fragments.iter().enumerate() {
        let base = FRAGMENT_TABLE_OFFSET + slot * 8;
        sector0[base..base + 3].copy_from_slice(&fragment.start.encode());
        sector0[base + 3] = fragment.mode;
        sector0[base + 4..base + 7].copy_from_slice(&fragment.end.encode());
        sector0[base + 7] = fragment.link;
    }

    sector1[..HEADER_LEN].copy_from_slice(&toc.header1);
    sector1[TITLE_MAP_OFFSET..TITLE_MAP_OFFSET + SLOT_COUNT].copy_from_slice(&toc.title_map);
    for (slot, cell) in toc.title_cells.iter().enumerate() {
        let base = TITLE_CELL_OFFSET + slot * 8;
        sector1[base..base + TITLE_CHARS].copy_from_slice(&cell.chars);
        sector1[base + TITLE_CHARS] = cell.link;
    }

    [sector0, sector1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_packing_round_trips() {
        for (cluster, sector, group) in [(0, 0, 0), (1, 31, 3), (0x3FFF, 63, 15), (1234, 17, 2)] {
            let addr = DiscAddress {
                cluster,
                sector,
                group,
            };
            assert_eq!(DiscAddress::decode(addr.encode()), addr);
        }
    }

    #[test]
    fn logical_addressing() {
        let addr = DiscAddress::from_logical(100);
        assert_eq!(addr.cluster, 3);
        assert_eq!(addr.sector, 4);
        assert_eq!(addr.to_logical(), 100);
    }

    #[test]
    fn toc_round_trips_through_sectors() {
        let mut toc = Toc::empty();
        toc.header0[0] = 0xAA;
        toc.add_track("Hello/World", 40, F_SP_MODE | F_STEREO | F_WRITABLE);
        toc.add_track("h_fs_00", 1, F_STEREO | F_WRITABLE);
        toc.add_track("", 3, F_STEREO);

        let [sector0, sector1] = reconstruct_toc(&toc);
        assert_eq!(sector0.len(), SECTOR_SIZE);
        let parsed = parse_toc(&sector0, &sector1).expect("parse");
        assert_eq!(parsed, toc);
    }

    #[test]
    fn titles_chain_across_cells() {
        let mut toc = Toc::empty();
        let long = "a-title-well-beyond-seven-characters";
        toc.add_track(long, 10, F_STEREO);
        assert_eq!(toc.title(TrackIndex(0)).as_deref(), Some(long));
    }

    #[test]
    fn untitled_track_has_no_title() {
        let mut toc = Toc::empty();
        toc.add_track("", 10, F_STEREO);
        assert_eq!(toc.title(TrackIndex(0)), None);
    }

    #[test]
    fn track_sectors_sum_fragment_spans() {
        let mut toc = Toc::empty();
        toc.add_track("one", 40, F_SP_MODE);
        toc.add_track("two", 7, 0);
        assert_eq!(toc.track_sectors(TrackIndex(0)), 40);
        assert_eq!(toc.track_sectors(TrackIndex(1)), 7);
    }

    #[test]
    fn remove_track_renumbers() {
        let mut toc = Toc::empty();
        toc.add_track("first", 10, F_STEREO);
        toc.add_track("second", 20, F_STEREO);
        toc.add_track("third", 30, F_STEREO);

        assert!(toc.remove_track(TrackIndex(1)));
        assert_eq!(toc.n_tracks, 2);
        assert_eq!(toc.title(TrackIndex(0)).as_deref(), Some("first"));
        assert_eq!(toc.title(TrackIndex(1)).as_deref(), Some("third"));
        assert_eq!(toc.track_sectors(TrackIndex(1)), 30);
        assert!(!toc.remove_track(TrackIndex(5)));
    }

    #[test]
    fn stamping_rewrites_every_fragment_in_the_chain() {
        let mut toc = Toc::empty();
        let index = toc.add_track("h_fs_03", 5, F_WRITABLE).expect("add");
        // Split the track into a two-fragment chain by hand.
        let head = toc.track_map[1];
        let second = (1..=255_u8).find(|s| *s != head).unwrap();
        toc.fragments[usize::from(head)].link = second;
        toc.fragments[usize::from(second)] = Fragment {
            start: DiscAddress::from_logical(512),
            mode: F_WRITABLE,
            end: DiscAddress::from_logical(515),
            link: 0,
        };

        toc.stamp_fragment_modes(index, F_SP_MODE | F_STEREO, F_WRITABLE);
        for slot in toc.fragment_chain(index) {
            let mode = toc.fragments[usize::from(slot)].mode;
            assert_eq!(mode & F_SP_MODE, F_SP_MODE);
            assert_eq!(mode & F_STEREO, F_STEREO);
            assert_eq!(mode & F_WRITABLE, 0);
        }
    }

    #[test]
    fn cyclic_fragment_chain_terminates() {
        let mut toc = Toc::empty();
        toc.add_track("looped", 4, 0);
        let head = toc.track_map[1];
        toc.fragments[usize::from(head)].link = head;
        assert_eq!(toc.fragment_chain(TrackIndex(0)), vec![head]);
    }

    #[test]
    fn short_sector_is_rejected() {
        let short = vec![0_u8; 100];
        let full = vec![0_u8; SECTOR_SIZE];
        assert!(parse_toc(&short, &full).is_err());
        assert!(parse_toc(&full, &short).is_err());
    }
}
