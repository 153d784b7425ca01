//! Free-entry bitmap, persistable to a file.
//!
//! An array of bits packed into 32-bit words, used for free disk sectors
//! and free swap sectors. The on-disk form is the word array serialized
//! little-endian from byte 0 of its backing file.

use crate::fs::open_file::OpenFile;

const BITS_IN_WORD: usize = 32;

pub struct BitMap {
    num_bits: usize,
    map: Vec<u32>,
}

impl BitMap {
    /// A bitmap of `num_bits` clear bits.
    pub fn new(num_bits: usize) -> BitMap {
        BitMap {
            num_bits,
            map: vec![0; num_bits.div_ceil(BITS_IN_WORD)],
        }
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Size of the serialized form, in bytes.
    pub fn file_size(&self) -> usize {
        self.map.len() * std::mem::size_of::<u32>()
    }

    pub fn mark(&mut self, which: usize) {
        assert!(which < self.num_bits);
        self.map[which / BITS_IN_WORD] |= 1 << (which % BITS_IN_WORD);
    }

    pub fn clear(&mut self, which: usize) {
        assert!(which < self.num_bits);
        self.map[which / BITS_IN_WORD] &= !(1 << (which % BITS_IN_WORD));
    }

    pub fn test(&self, which: usize) -> bool {
        assert!(which < self.num_bits);
        self.map[which / BITS_IN_WORD] & (1 << (which % BITS_IN_WORD)) != 0
    }

    /// Find the first clear bit and mark it, returning its index.
    pub fn find(&mut self) -> Option<usize> {
        for i in 0..self.num_bits {
            if !self.test(i) {
                self.mark(i);
                return Some(i);
            }
        }
        None
    }

    /// How many bits are unallocated.
    pub fn num_clear(&self) -> usize {
        (0..self.num_bits).filter(|&i| !self.test(i)).count()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.map.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn load_bytes(&mut self, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks_exact(4).enumerate().take(self.map.len()) {
            self.map[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
    }

    /// Initialize the contents from the backing file.
    pub fn fetch_from(&mut self, file: &OpenFile) {
        let mut bytes = vec![0u8; self.file_size()];
        file.read_at(&mut bytes, 0);
        self.load_bytes(&bytes);
    }

    /// Store the contents to the backing file.
    pub fn write_back(&self, file: &OpenFile) {
        file.write_at(&self.to_bytes(), 0);
    }

    /// The indices of the set bits, for the file-system dump.
    pub fn set_bits(&self) -> Vec<usize> {
        (0..self.num_bits).filter(|&i| self.test(i)).collect()
    }
}
