//! Coordinate math shared by every layer: chunk to region mapping, slot
//! indexing within a region and region file naming.

use std::path::{Path, PathBuf};

/// Width of a region in chunks, along both axes.
pub const REGION_SIZE: i32 = 32;

/// Number of chunk slots in a region file.
pub const REGION_CHUNKS: usize = 1024;

/// File extension of LRF region files.
pub const LRF_EXTENSION: &str = "lrf";

/// File extension of legacy sector-based region files.
pub const LEGACY_EXTENSION: &str = "mca";

/// Calculate the slot index of a chunk in its region file, this is the same
/// calculation for any chunk coordinate because the position is taken at
/// modulo 32.
#[inline]
pub fn chunk_index(cx: i32, cz: i32) -> usize {
    (cx & 31) as usize | (((cz & 31) as usize) << 5)
}

/// Reverse of [`chunk_index`], returning chunk coordinates local to the
/// region, in range `0..32`.
#[inline]
pub fn chunk_of_index(index: usize) -> (i32, i32) {
    ((index & 31) as i32, (index >> 5 & 31) as i32)
}

/// Calculate the region coordinates containing the given chunk.
#[inline]
pub fn region_of_chunk(cx: i32, cz: i32) -> (i32, i32) {
    (cx >> 5, cz >> 5)
}

/// Return true if two chunks live in the same region file.
#[inline]
pub fn same_region(cx0: i32, cz0: i32, cx1: i32, cz1: i32) -> bool {
    region_of_chunk(cx0, cz0) == region_of_chunk(cx1, cz1)
}

/// Path of the LRF region file storing the given region coordinates.
pub fn region_file_path(dir: &Path, rx: i32, rz: i32) -> PathBuf {
    dir.join(format!("r.{rx}.{rz}.{LRF_EXTENSION}"))
}

/// Path of the legacy region file storing the given region coordinates.
pub fn legacy_file_path(dir: &Path, rx: i32, rz: i32) -> PathBuf {
    dir.join(format!("r.{rx}.{rz}.{LEGACY_EXTENSION}"))
}

/// A square-spiral iterator around an origin chunk, used by the prefetch
/// engine to enumerate neighbor candidates from nearest ring to farthest.
pub struct SpiralIter {
    cx: i32,
    cz: i32,
    radius: i32,
    ring: i32,
    step: usize,
    perimeter: Vec<(i32, i32)>,
}

impl SpiralIter {

    pub fn new(cx: i32, cz: i32, radius: i32) -> Self {
        Self {
            cx,
            cz,
            radius,
            ring: 0,
            step: 0,
            perimeter: vec![(0, 0)],
        }
    }

    /// Compute the perimeter offsets of the given ring, walked clockwise
    /// starting from the north-west corner.
    fn ring_perimeter(ring: i32) -> Vec<(i32, i32)> {
        let mut offsets = Vec::with_capacity((ring as usize) * 8);
        for dx in -ring..=ring {
            offsets.push((dx, -ring));
        }
        for dz in -ring + 1..=ring {
            offsets.push((ring, dz));
        }
        for dx in (-ring..ring).rev() {
            offsets.push((dx, ring));
        }
        for dz in (-ring + 1..ring).rev() {
            offsets.push((-ring, dz));
        }
        offsets
    }

}

impl Iterator for SpiralIter {

    type Item = (i32, i32);

    fn next(&mut self) -> Option<(i32, i32)> {
        loop {
            if self.step < self.perimeter.len() {
                let (dx, dz) = self.perimeter[self.step];
                self.step += 1;
                return Some((self.cx + dx, self.cz + dz));
            }
            if self.ring >= self.radius {
                return None;
            }
            self.ring += 1;
            self.step = 0;
            self.perimeter = Self::ring_perimeter(self.ring);
        }
    }

}
