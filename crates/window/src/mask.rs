//! Boundary bitmaps over sorted hash-group rows.
//!
//! A mask holds one bit per row; bit `i` is set iff row `i` starts a new
//! partition (partition mask) or a new peer group (order mask). Bit 0 is set
//! for every non-empty group.

use arrow::array::BooleanBufferBuilder;
use arrow::buffer::BooleanBuffer;

/// Immutable boundary bitmap.
#[derive(Debug, Clone)]
pub struct BoundaryMask {
    buf: BooleanBuffer,
}

/// Builder for [`BoundaryMask`], initialized to all-unset.
pub struct BoundaryMaskBuilder {
    builder: BooleanBufferBuilder,
}

impl BoundaryMaskBuilder {
    /// Create a builder for `len` rows with no boundaries set.
    pub fn new(len: usize) -> Self {
        let mut builder = BooleanBufferBuilder::new(len);
        builder.append_n(len, false);
        Self { builder }
    }

    /// Mark row `idx` as a boundary.
    pub fn set(&mut self, idx: usize) {
        self.builder.set_bit(idx, true);
    }

    /// Finish into an immutable mask.
    pub fn finish(mut self) -> BoundaryMask {
        BoundaryMask {
            buf: self.builder.finish(),
        }
    }
}

impl BoundaryMask {
    /// Number of rows covered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when the mask covers zero rows.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    /// Whether row `idx` starts a new span.
    pub fn is_boundary(&self, idx: usize) -> bool {
        self.buf.value(idx)
    }

    /// Start of the span containing `pos`: the greatest boundary at or before
    /// `pos`. Relies on bit 0 being set for non-empty masks.
    pub fn span_start(&self, pos: usize) -> usize {
        let mut i = pos;
        loop {
            if self.buf.value(i) {
                return i;
            }
            if i == 0 {
                return 0;
            }
            i -= 1;
        }
    }

    /// End of the span containing `pos`: the least boundary after `pos`, or
    /// `len` when the span runs to the end.
    pub fn span_end(&self, pos: usize) -> usize {
        let mut i = pos + 1;
        while i < self.buf.len() {
            if self.buf.value(i) {
                return i;
            }
            i += 1;
        }
        self.buf.len()
    }

    /// Count of boundaries in `[start, end)`.
    pub fn count_boundaries(&self, start: usize, end: usize) -> usize {
        (start..end.min(self.buf.len()))
            .filter(|&i| self.buf.value(i))
            .count()
    }

    /// Positions of all boundaries in `[start, end)`.
    pub fn boundaries_in(&self, start: usize, end: usize) -> Vec<usize> {
        (start..end.min(self.buf.len()))
            .filter(|&i| self.buf.value(i))
            .collect()
    }
}
