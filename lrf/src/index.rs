//! Best-effort world index sidecar: one byte per chunk packing a generated
//! flag, a height class and a biome class. Populated during chunk saves
//! and never load-bearing; a missing or damaged file degrades to "nothing
//! known".

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::warn;

use crate::coord::{chunk_index, region_of_chunk, REGION_CHUNKS};

/// File name of the sidecar inside a region directory.
pub const WORLD_INDEX_FILE: &str = "turbo_index";

/// Per-chunk index entry: `generated:1 | height:4 | biome:3`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub generated: bool,
    /// Height class, 0..16.
    pub height: u8,
    /// Biome class, 0..8.
    pub biome: u8,
}

impl IndexEntry {

    pub fn pack(self) -> u8 {
        (self.generated as u8) << 7 | (self.height & 0x0F) << 3 | (self.biome & 0x07)
    }

    pub fn unpack(byte: u8) -> Self {
        Self {
            generated: byte & 0x80 != 0,
            height: byte >> 3 & 0x0F,
            biome: byte & 0x07,
        }
    }

}

/// The in-memory world index, one 1024-byte record per touched region.
/// Records are rewritten wholesale on flush through a temporary file so a
/// crash can only lose updates, never corrupt the sidecar.
pub struct WorldIndex {
    path: PathBuf,
    regions: Mutex<HashMap<(i32, i32), Box<[u8; REGION_CHUNKS]>>>,
    dirty: AtomicBool,
}

impl WorldIndex {

    /// Load the sidecar at `dir/turbo_index`, tolerating a missing or
    /// truncated file.
    pub fn load(dir: &Path) -> Self {

        let path = dir.join(WORLD_INDEX_FILE);
        let mut regions = HashMap::new();

        match File::open(&path) {
            Err(_) => {}
            Ok(mut file) => {
                let mut record = [0u8; 8 + REGION_CHUNKS];
                loop {
                    match file.read_exact(&mut record) {
                        Ok(()) => {
                            let rx = LittleEndian::read_i32(&record[0..4]);
                            let rz = LittleEndian::read_i32(&record[4..8]);
                            let mut entries = Box::new([0u8; REGION_CHUNKS]);
                            entries.copy_from_slice(&record[8..]);
                            regions.insert((rx, rz), entries);
                        }
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                        Err(e) => {
                            warn!("world index {} unreadable: {e}", path.display());
                            break;
                        }
                    }
                }
            }
        }

        Self {
            path,
            regions: Mutex::new(regions),
            dirty: AtomicBool::new(false),
        }

    }

    pub fn get(&self, cx: i32, cz: i32) -> IndexEntry {
        let region = region_of_chunk(cx, cz);
        self.regions.lock()
            .get(&region)
            .map(|entries| IndexEntry::unpack(entries[chunk_index(cx, cz)]))
            .unwrap_or_default()
    }

    pub fn set(&self, cx: i32, cz: i32, entry: IndexEntry) {
        let region = region_of_chunk(cx, cz);
        let mut regions = self.regions.lock();
        let entries = regions.entry(region)
            .or_insert_with(|| Box::new([0u8; REGION_CHUNKS]));
        entries[chunk_index(cx, cz)] = entry.pack();
        self.dirty.store(true, Ordering::Release);
    }

    /// Mark a chunk generated without touching its other classes.
    pub fn mark_generated(&self, cx: i32, cz: i32) {
        let mut entry = self.get(cx, cz);
        if !entry.generated {
            entry.generated = true;
            self.set(cx, cz, entry);
        }
    }

    /// Persist if anything changed since the last flush.
    pub fn flush(&self) -> io::Result<()> {

        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let tmp = self.path.with_extension("tmp");
        {
            let regions = self.regions.lock();
            let mut file = File::create(&tmp)?;
            let mut head = [0u8; 8];
            for ((rx, rz), entries) in regions.iter() {
                LittleEndian::write_i32(&mut head[0..4], *rx);
                LittleEndian::write_i32(&mut head[4..8], *rz);
                file.write_all(&head)?;
                file.write_all(&entries[..])?;
            }
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)

    }

}
