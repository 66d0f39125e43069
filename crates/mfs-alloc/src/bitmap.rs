//! Raw bit manipulation on allocation bitmaps.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8`; a set bit means the
//! item is allocated. Out-of-range reads report "free" and out-of-range
//! writes are ignored; callers bound indices by the pool size.

/// Get bit `idx`.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx`.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx`.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set bits among the first `count` bits.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut set: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_ones())
        .sum();
    if remainder > 0 && full_bytes < bitmap.len() {
        let mask = (1_u8 << remainder) - 1;
        set += (bitmap[full_bytes] & mask).count_ones();
    }
    set
}

/// Find the first clear bit in `[start, count)` for which `skip` is false.
///
/// Scans forward only; bits below `start` are never visited. Fully
/// allocated bytes are skipped without testing individual bits.
#[must_use]
pub fn bitmap_find_free_from(
    bitmap: &[u8],
    count: u32,
    start: u32,
    skip: impl Fn(u32) -> bool,
) -> Option<u32> {
    let mut idx = start;
    while idx < count {
        let byte_idx = (idx / 8) as usize;
        if idx % 8 == 0 && bitmap.get(byte_idx) == Some(&0xFF) {
            idx += 8;
            continue;
        }
        if !bitmap_get(bitmap, idx) && !skip(idx) {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0_u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        bitmap_set(&mut bm, 31);
        assert!(bitmap_get(&bm, 0));
        assert!(bitmap_get(&bm, 9));
        assert!(bitmap_get(&bm, 31));
        assert_eq!(bm[1], 0b0000_0010);
        bitmap_clear(&mut bm, 9);
        assert!(!bitmap_get(&bm, 9));

        bitmap_set(&mut bm, 100);
        assert!(!bitmap_get(&bm, 100));
    }

    #[test]
    fn bitmap_count_set_respects_count() {
        let bm = [0xFF_u8, 0b0000_0111];
        assert_eq!(bitmap_count_set(&bm, 16), 11);
        assert_eq!(bitmap_count_set(&bm, 10), 10);
        assert_eq!(bitmap_count_set(&bm, 4), 4);
        assert_eq!(bitmap_count_set(&bm, 0), 0);
    }

    #[test]
    fn find_free_scans_forward_without_wrapping() {
        let mut bm = vec![0xFF_u8; 4];
        bitmap_clear(&mut bm, 3);
        bitmap_clear(&mut bm, 20);
        assert_eq!(bitmap_find_free_from(&bm, 32, 0, |_| false), Some(3));
        assert_eq!(bitmap_find_free_from(&bm, 32, 4, |_| false), Some(20));
        assert_eq!(bitmap_find_free_from(&bm, 32, 21, |_| false), None);
        assert_eq!(bitmap_find_free_from(&bm, 20, 4, |_| false), None);
    }

    #[test]
    fn find_free_honors_skip() {
        let bm = vec![0_u8; 2];
        assert_eq!(bitmap_find_free_from(&bm, 16, 0, |i| i < 5), Some(5));
        assert_eq!(bitmap_find_free_from(&bm, 16, 0, |_| true), None);
    }
}
