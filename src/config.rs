use crate::{ArrayId, REVMAP_ENTRY_LEN};

/// Geometry and identity of one array's segment space, shared by the
/// accounting context and the reverse-map manager.
///
/// All fields are plain data; the struct is cheap to clone and is handed
/// to each component at construction rather than read from ambient
/// global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// The id of the array this configuration describes.
    pub array_id: ArrayId,
    /// Number of erase-unit-sized segments in the array.
    pub segments: u32,
    /// Blocks per segment.
    pub blocks_per_segment: u32,
    /// Stripes per segment. Must divide `blocks_per_segment`.
    pub stripes_per_segment: u32,
    /// Size in bytes of one reverse-map page. Page 0 of every pack is
    /// the header page.
    pub revmap_page_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            array_id: 0,
            segments: 64,
            blocks_per_segment: 256,
            stripes_per_segment: 8,
            revmap_page_size: 4096,
        }
    }
}

impl Config {
    pub fn blocks_per_stripe(&self) -> u32 {
        assert_eq!(
            self.blocks_per_segment % self.stripes_per_segment,
            0,
            "stripes per segment must divide blocks per segment"
        );
        self.blocks_per_segment / self.stripes_per_segment
    }

    pub fn total_stripes(&self) -> u32 {
        self.segments * self.stripes_per_segment
    }

    /// Number of pages in one stripe's reverse-map pack: the header page
    /// plus however many map pages the stripe's entries need.
    pub fn revmap_pages_per_stripe(&self) -> u32 {
        let entry_bytes =
            self.blocks_per_stripe() as usize * REVMAP_ENTRY_LEN;
        let map_pages = entry_bytes.div_ceil(self.revmap_page_size);
        1 + map_pages as u32
    }

    /// Byte length of one stripe's reverse-map pack in the backing file.
    pub fn revmap_file_size_per_stripe(&self) -> u64 {
        self.revmap_pages_per_stripe() as u64 * self.revmap_page_size as u64
    }

    /// Byte length of the whole reverse-map file for this array.
    pub fn revmap_whole_file_size(&self) -> u64 {
        self.revmap_file_size_per_stripe() * u64::from(self.total_stripes())
    }
}
