//! Fixed-size node bitmaps.
//!
//! A `NodeBitmap` is a `BitVec` over the cluster's node index space. Every
//! bitmap handed around by one node table has the same size, so set
//! operations between two bitmaps are always bit-for-bit aligned. Bits
//! beyond the shorter operand are treated as clear.
//!
//! ```
//! use fairgrid_core::NodeBitmap;
//!
//! let mut granted = NodeBitmap::new(8);
//! granted.set(1).unwrap();
//! granted.set(2).unwrap();
//! let avail = NodeBitmap::from_list(8, "0-2").unwrap();
//! assert_eq!(granted.and(&avail).to_string(), "1-2");
//! ```

use std::fmt;

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeBitmap {
    bits: BitVec<u64, Lsb0>,
}

impl NodeBitmap {
    /// Build an empty bitmap covering `size` nodes.
    pub fn new(size: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; size],
        }
    }

    /// Build a bitmap with every one of `size` nodes set.
    pub fn full(size: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 1; size],
        }
    }

    /// Build a bitmap from node indices.
    pub fn from_indices<I>(size: usize, indices: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut map = Self::new(size);
        for index in indices {
            map.set(index)?;
        }
        Ok(map)
    }

    /// Parse an index list such as `"0-3,7,9-10"`.
    pub fn from_list(size: usize, list: &str) -> CoreResult<Self> {
        let mut map = Self::new(size);
        let list = list.trim();
        if list.is_empty() {
            return Ok(map);
        }
        for group in list.split(',') {
            let group = group.trim();
            let (lo, hi) = match group.split_once('-') {
                Some((lo, hi)) => (parse_index(lo, group)?, parse_index(hi, group)?),
                None => {
                    let idx = parse_index(group, group)?;
                    (idx, idx)
                }
            };
            if lo > hi {
                return Err(CoreError::InvalidRange(group.to_string()));
            }
            for index in lo..=hi {
                map.set(index)?;
            }
        }
        Ok(map)
    }

    fn check(&self, index: usize) -> CoreResult<()> {
        if index >= self.bits.len() {
            return Err(CoreError::IndexOutOfRange {
                index,
                size: self.bits.len(),
            });
        }
        Ok(())
    }

    /// Number of node slots covered by the bitmap.
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    pub fn set(&mut self, index: usize) -> CoreResult<()> {
        self.check(index)?;
        self.bits.set(index, true);
        Ok(())
    }

    pub fn clear(&mut self, index: usize) -> CoreResult<()> {
        self.check(index)?;
        self.bits.set(index, false);
        Ok(())
    }

    /// Test a node bit. Indices past the end read as clear.
    pub fn test(&self, index: usize) -> bool {
        self.bits.get(index).map(|bit| *bit).unwrap_or(false)
    }

    /// Count of set bits.
    pub fn weight(&self) -> usize {
        self.bits.count_ones()
    }

    /// True when no bit is set.
    pub fn is_clear(&self) -> bool {
        self.bits.not_any()
    }

    /// Set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn and(&self, other: &NodeBitmap) -> NodeBitmap {
        let mut out = NodeBitmap::new(self.size());
        for index in self.iter().filter(|&i| other.test(i)) {
            out.bits.set(index, true);
        }
        out
    }

    pub fn or(&self, other: &NodeBitmap) -> NodeBitmap {
        let size = self.size().max(other.size());
        let mut out = NodeBitmap::new(size);
        for index in self.iter().chain(other.iter()) {
            out.bits.set(index, true);
        }
        out
    }

    /// Bits set in `self` but not in `other`.
    pub fn and_not(&self, other: &NodeBitmap) -> NodeBitmap {
        let mut out = NodeBitmap::new(self.size());
        for index in self.iter().filter(|&i| !other.test(i)) {
            out.bits.set(index, true);
        }
        out
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &NodeBitmap) -> bool {
        self.iter().all(|i| other.test(i))
    }

    /// The lowest `n` set bits, or `None` if fewer than `n` are set.
    pub fn first_n(&self, n: usize) -> Option<NodeBitmap> {
        let mut out = NodeBitmap::new(self.size());
        let mut taken = 0;
        for index in self.iter().take(n) {
            out.bits.set(index, true);
            taken += 1;
        }
        (taken == n).then_some(out)
    }

    /// Position of `index` among the set bits (0-based), if it is set.
    pub fn rank(&self, index: usize) -> Option<usize> {
        if !self.test(index) {
            return None;
        }
        Some(self.bits[..index].count_ones())
    }
}

fn parse_index(text: &str, group: &str) -> CoreResult<usize> {
    text.trim()
        .parse::<usize>()
        .map_err(|_| CoreError::InvalidRange(group.to_string()))
}

/// Formats as a compact range list: `0-3,7`.
impl fmt::Display for NodeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
