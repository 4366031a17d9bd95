//! The byte-offset ledger: an exact count of the bytes written to one output
//! document so far, and the scan-number → offset pairs destined for the
//! trailing `<index>` section.

use indexmap::IndexMap;

/// Leading spaces before an MS1 `<scan` tag.
pub const MS1_SCAN_INDENT: u64 = 2;
/// Leading spaces before an MS2 `<scan` tag.
pub const MS2_SCAN_INDENT: u64 = 3;

/// The writer's line terminator. The ledger's fixed correction for lines it
/// is told lack one is this sequence's length.
pub const LINE_TERMINATOR: &str = "\r\n";

/// One `<offset>` entry of the trailing index: the byte position of a scan's
/// opening `<scan` literal within the document. Scan number 0 is reserved for
/// the offset of the index section itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub scan_number: u64,
    pub byte_depth: u64,
}

/// Tracks cumulative bytes written to one output document and hands out the
/// 1-based output scan numbers. Created fresh per CV value and mutated only
/// by the document writer, single threaded.
#[derive(Debug)]
pub struct ByteLedger {
    byte_depth: u64,
    offsets: IndexMap<u64, u64>,
    current_scan: u64,
}

impl Default for ByteLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteLedger {
    pub fn new() -> ByteLedger {
        ByteLedger {
            byte_depth: 0,
            offsets: IndexMap::new(),
            current_scan: 1,
        }
    }

    /// Number of bytes of the document written so far.
    pub fn byte_depth(&self) -> u64 {
        self.byte_depth
    }

    /// Claim the next output scan number. Numbers start at 1 and increase
    /// strictly monotonically in write order.
    pub fn next_scan_number(&mut self) -> u64 {
        let scan_number = self.current_scan;
        self.current_scan += 1;
        scan_number
    }

    /// Capture the offset for the scan about to be written. Must be called
    /// before any of that scan's bytes are advanced past; `indent` is the
    /// width of the whitespace prefix ahead of the `<scan` literal
    /// ([`MS1_SCAN_INDENT`] or [`MS2_SCAN_INDENT`]).
    pub fn record_scan_start(&mut self, output_scan_number: u64, indent: u64) {
        self.offsets
            .insert(output_scan_number, self.byte_depth + indent);
    }

    /// Record the byte position where the `<index>` section begins, under the
    /// reserved scan number 0.
    pub fn record_index_offset(&mut self, byte_depth: u64) {
        self.offsets.insert(0, byte_depth);
    }

    /// Advance the cumulative depth by the encoded length of `text`. When the
    /// text does not already end with the line terminator the writer will add
    /// one, so the ledger counts it here.
    pub fn advance(&mut self, text: &str, has_trailing_newline: bool) {
        self.byte_depth += text.len() as u64;
        if !has_trailing_newline {
            self.byte_depth += LINE_TERMINATOR.len() as u64;
        }
    }

    /// The scan entries in document order, excluding the reserved
    /// index-offset entry.
    pub fn scan_entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.offsets
            .iter()
            .filter(|(scan_number, _)| **scan_number != 0)
            .map(|(scan_number, byte_depth)| IndexEntry {
                scan_number: *scan_number,
                byte_depth: *byte_depth,
            })
    }

    /// The byte position recorded for the `<index>` section, if any.
    pub fn index_offset(&self) -> Option<u64> {
        self.offsets.get(&0).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
