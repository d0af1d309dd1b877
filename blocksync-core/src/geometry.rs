//! Sector, bit, and extent numbering conversions.
//!
//! The device is addressed in 512-byte sectors everywhere on the wire and
//! on disk. Three coarser grids are laid on top of that: the 4 KiB bitmap
//! bit, the 4 MiB activity-log extent, and the 16 MiB bitmap extent. All
//! conversions between them are pure shifts.

/// Bytes per sector.
pub const SECTOR_SIZE: u64 = 512;

/// Bytes per bitmap bit (one 4 KiB block of backing storage).
pub const BM_BIT_SIZE: u64 = 4096;
/// Sectors per bitmap bit.
pub const SECTORS_PER_BIT: u64 = BM_BIT_SIZE / SECTOR_SIZE;
const BIT_SHIFT: u32 = SECTORS_PER_BIT.trailing_zeros();

/// Bytes per AL extent (4 MiB).
pub const AL_EXTENT_SIZE: u64 = 4 * 1024 * 1024;
/// Sectors per AL extent.
pub const AL_EXTENT_SECTORS: u64 = AL_EXTENT_SIZE / SECTOR_SIZE;
const AL_EXTENT_SHIFT: u32 = AL_EXTENT_SECTORS.trailing_zeros();

/// Bytes per BM extent (16 MiB).
pub const BM_EXTENT_SIZE: u64 = 16 * 1024 * 1024;
/// Sectors per BM extent.
pub const BM_EXTENT_SECTORS: u64 = BM_EXTENT_SIZE / SECTOR_SIZE;
const BM_EXTENT_SHIFT: u32 = BM_EXTENT_SECTORS.trailing_zeros();

/// Number of AL extents that fit in one BM extent.
pub const AL_EXT_PER_BM_SECT: u32 = (BM_EXTENT_SIZE / AL_EXTENT_SIZE) as u32;

/// Sentinel meaning "no extent installed" for an LRU slot.
pub const LC_FREE: u32 = u32::MAX;

/// Maximum bio size this core will accept in a single `set_*` call (32 MiB,
/// matching the largest request a single AL transaction's worth of extents
/// could plausibly cover without fragmenting across many transactions).
pub const MAX_BIO_SIZE: u64 = 32 * 1024 * 1024;

/// Convert a sector number to the bitmap bit covering it.
pub fn sector_to_bit(sector: u64) -> u64 {
    sector >> BIT_SHIFT
}

/// Convert a bitmap bit number back to its first sector.
pub fn bit_to_sector(bit: u64) -> u64 {
    bit << BIT_SHIFT
}

/// Convert a sector number to the AL extent number covering it.
pub fn sector_to_al_enr(sector: u64) -> u32 {
    (sector >> AL_EXTENT_SHIFT) as u32
}

/// Convert an AL extent number to its first sector.
pub fn al_enr_to_sector(enr: u32) -> u64 {
    (enr as u64) << AL_EXTENT_SHIFT
}

/// Convert a sector number to the BM extent number covering it.
pub fn sector_to_bm_enr(sector: u64) -> u32 {
    (sector >> BM_EXTENT_SHIFT) as u32
}

/// Convert a BM extent number to its first sector.
pub fn bm_enr_to_sector(enr: u32) -> u64 {
    (enr as u64) << BM_EXTENT_SHIFT
}

/// Convert a BM extent number to its first bitmap bit.
pub fn bm_enr_to_first_bit(enr: u32) -> u64 {
    sector_to_bit(bm_enr_to_sector(enr))
}

/// Convert a BM extent number to its last bitmap bit (inclusive).
pub fn bm_enr_to_last_bit(enr: u32) -> u64 {
    bm_enr_to_first_bit(enr) + (BM_EXTENT_SIZE / BM_BIT_SIZE) - 1
}

/// The BM extent that an AL extent falls within (arithmetic overlap, no
/// pointer cycles between the two LRUs).
pub fn al_enr_to_bm_enr(al_enr: u32) -> u32 {
    al_enr / AL_EXT_PER_BM_SECT
}

/// The (inclusive) range of AL extents contained by a BM extent.
pub fn bm_enr_to_al_enr_range(bm_enr: u32) -> core::ops::RangeInclusive<u32> {
    let first = bm_enr * AL_EXT_PER_BM_SECT;
    first..=(first + AL_EXT_PER_BM_SECT - 1)
}

/// The inclusive BM extent range `[sector, sector + size)` covers.
/// `size` is in bytes and must be a non-zero multiple of 512.
pub fn bm_extent_range(sector: u64, size: u64) -> (u32, u32) {
    debug_assert!(size > 0 && size % SECTOR_SIZE == 0);
    let last_sector = sector + size / SECTOR_SIZE - 1;
    (sector_to_bm_enr(sector), sector_to_bm_enr(last_sector))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn al_extent_is_8192_sectors() {
        assert_eq!(AL_EXTENT_SECTORS, 8192);
    }

    #[test]
    fn bm_extent_is_4_al_extents() {
        assert_eq!(AL_EXT_PER_BM_SECT, 4);
    }

    #[test]
    fn overlap_is_consistent_both_ways() {
        for al_enr in 0..40u32 {
            let bm_enr = al_enr_to_bm_enr(al_enr);
            assert!(bm_enr_to_al_enr_range(bm_enr).contains(&al_enr));
        }
    }

    #[test]
    fn sector_bit_round_trip() {
        let sector = 123 * SECTORS_PER_BIT;
        assert_eq!(bit_to_sector(sector_to_bit(sector)), sector);
    }

    #[test]
    fn bm_extent_range_spans_multiple_extents() {
        let (first, last) = bm_extent_range(0, BM_EXTENT_SIZE * 2);
        assert_eq!(first, 0);
        assert_eq!(last, 1);
    }
}
