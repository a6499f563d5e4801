//! # Window Module
//!
//! Window definitions and window batches.
//!
//! A window definition (row-count or time-range, with size and slide) is
//! supplied by the query layer and consumed here; this module computes the
//! byte-offset boundaries of each window inside a batch and sequences the
//! incremental enter/exit/evaluate protocol that overlapping sliding
//! windows enable. It performs no aggregation itself.

mod batch;

pub use batch::{IncrementalComputation, WindowBatch, EMPTY_WINDOW, NO_MARK, UNSET_OFFSET};

/// Kind of windowing applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Windows defined over tuple counts.
    Row,
    /// Windows defined over timestamp ranges.
    Range,
}

/// An externally supplied window definition.
///
/// `size` and `slide` are tuple counts for row windows and timestamp units
/// for range windows. `slide == size` describes a tumbling window, while
/// `slide < size` describes a sliding window with overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDefinition {
    kind: WindowKind,
    size: u64,
    slide: u64,
}

impl WindowDefinition {
    /// Creates a row-count window definition.
    ///
    /// # Panics
    ///
    /// Panics if `size` or `slide` is zero.
    #[must_use]
    pub fn row(size: u64, slide: u64) -> Self {
        Self::new(WindowKind::Row, size, slide)
    }

    /// Creates a time-range window definition.
    ///
    /// # Panics
    ///
    /// Panics if `size` or `slide` is zero.
    #[must_use]
    pub fn range(size: u64, slide: u64) -> Self {
        Self::new(WindowKind::Range, size, slide)
    }

    fn new(kind: WindowKind, size: u64, slide: u64) -> Self {
        assert!(size > 0, "window size must be > 0");
        assert!(slide > 0, "window slide must be > 0");
        Self { kind, size, slide }
    }

    /// The window kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    /// Window size, in tuples or timestamp units.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Window slide, in tuples or timestamp units.
    #[inline]
    #[must_use]
    pub fn slide(&self) -> u64 {
        self.slide
    }

    /// Returns true for row-count windows.
    #[inline]
    #[must_use]
    pub fn is_row_based(&self) -> bool {
        self.kind == WindowKind::Row
    }

    /// Returns true when consecutive windows overlap by more than half the
    /// window, the regime where incremental aggregation pays off.
    #[inline]
    #[must_use]
    pub fn overlaps_majority(&self) -> bool {
        self.slide < self.size / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let rows = WindowDefinition::row(64, 16);
        assert!(rows.is_row_based());
        assert_eq!(rows.size(), 64);
        assert_eq!(rows.slide(), 16);

        let range = WindowDefinition::range(1_000, 1_000);
        assert_eq!(range.kind(), WindowKind::Range);
    }

    #[test]
    fn test_overlap_gate() {
        assert!(WindowDefinition::row(64, 16).overlaps_majority());
        // Exactly half does not qualify.
        assert!(!WindowDefinition::row(64, 32).overlaps_majority());
        assert!(!WindowDefinition::row(64, 64).overlaps_majority());
    }

    #[test]
    #[should_panic(expected = "slide must be > 0")]
    fn test_zero_slide_panics() {
        let _ = WindowDefinition::row(8, 0);
    }
}
