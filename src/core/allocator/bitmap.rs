//! Block bitmap stored inside each segment header
//!
//! One bit per block, least significant bit first:
//! - 0 = free block
//! - 1 = allocated block
//!
//! The bitmap operates directly on the mapped header bytes.

/// View over a segment's bitmap bytes
pub struct Bitmap<B> {
    bits: B,
}

impl<B: AsRef<[u8]>> Bitmap<B> {
    pub fn new(bits: B) -> Self {
        Bitmap { bits }
    }

    /// Number of bits tracked
    pub fn len(&self) -> u32 {
        (self.bits.as_ref().len() * 8) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.as_ref().is_empty()
    }

    pub fn is_set(&self, index: u32) -> bool {
        let bytes = self.bits.as_ref();
        (bytes[(index / 8) as usize] >> (index % 8)) & 1 == 1
    }

    /// True if every bit in `[start, start + len)` is set
    pub fn are_set(&self, start: u32, len: u32) -> bool {
        match start.checked_add(len) {
            Some(end) if end <= self.len() => (start..end).all(|i| self.is_set(i)),
            _ => false,
        }
    }

    pub fn count_clear(&self) -> u32 {
        self.bits
            .as_ref()
            .iter()
            .map(|byte| byte.count_zeros())
            .sum()
    }

    /// Find `len` contiguous clear bits
    ///
    /// Searches from `hint` to the end first, then wraps around to the start.
    /// A run never straddles the end of the bitmap.
    pub fn find_clear_run(&self, len: u32, hint: u32) -> Option<u32> {
        let total = self.len();
        if len == 0 || len > total {
            return None;
        }
        let hint = if hint >= total { 0 } else { hint };

        self.scan(hint, total, len).or_else(|| {
            let wrap_end = hint.saturating_add(len - 1).min(total);
            self.scan(0, wrap_end, len)
        })
    }

    fn scan(&self, from: u32, to: u32, len: u32) -> Option<u32> {
        let bytes = self.bits.as_ref();
        let mut run_start = from;
        let mut run = 0;
        let mut i = from;

        while i < to {
            // Skip fully allocated bytes
            if i % 8 == 0 && i + 8 <= to && bytes[(i / 8) as usize] == 0xFF {
                run = 0;
                i += 8;
                continue;
            }

            if self.is_set(i) {
                run = 0;
            } else {
                if run == 0 {
                    run_start = i;
                }
                run += 1;
                if run == len {
                    return Some(run_start);
                }
            }
            i += 1;
        }

        None
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bitmap<B> {
    pub fn set_range(&mut self, start: u32, len: u32) {
        let bytes = self.bits.as_mut();
        for i in start..start + len {
            bytes[(i / 8) as usize] |= 1 << (i % 8);
        }
    }

    pub fn clear_range(&mut self, start: u32, len: u32) {
        let bytes = self.bits.as_mut();
        for i in start..start + len {
            bytes[(i / 8) as usize] &= !(1 << (i % 8));
        }
    }

    /// Find a run of `len` clear bits and mark it allocated
    pub fn find_clear_run_and_set(&mut self, len: u32, hint: u32) -> Option<u32> {
        let start = self.find_clear_run(len, hint)?;
        self.set_range(start, len);
        Some(start)
    }
}
