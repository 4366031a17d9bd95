//! The contract between the converter core and whatever component opens an
//! instrument file, along with an in-memory implementation used by tests and
//! embedders.

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

use crate::scan::RawScanView;

/// The errors that may occur while fetching a single scan. None of these are
/// fatal to a conversion run; the affected scan is skipped.
#[derive(Debug, Error)]
pub enum ScanAccessError {
    #[error("The scan number {0} is not present in the acquisition")]
    ScanNotFound(usize),
    #[error("An IO error occurred while reading a scan: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
}

/// A source of scans addressable by scan number.
///
/// Scan numbers run from [`first_scan_number`](AcquisitionSource::first_scan_number)
/// to [`last_scan_number`](AcquisitionSource::last_scan_number) inclusive, but
/// the range may contain gaps: a missing number is reported per-scan via
/// [`ScanAccessError::ScanNotFound`] and is not an error for the run overall.
pub trait AcquisitionSource {
    /// The number of scans the acquisition claims to contain.
    fn scan_count(&self) -> usize;

    /// The lowest addressable scan number.
    fn first_scan_number(&self) -> usize {
        1
    }

    /// The highest addressable scan number.
    fn last_scan_number(&self) -> usize {
        self.scan_count()
    }

    /// Fetch one scan's metadata and peak arrays.
    fn get_scan(&mut self, scan_number: usize) -> Result<RawScanView, ScanAccessError>;
}

/// An [`AcquisitionSource`] over scans already held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryAcquisition {
    scans: BTreeMap<usize, RawScanView>,
}

impl MemoryAcquisition {
    pub fn new<I: IntoIterator<Item = RawScanView>>(scans: I) -> MemoryAcquisition {
        MemoryAcquisition {
            scans: scans
                .into_iter()
                .map(|scan| (scan.scan_number, scan))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }
}

impl FromIterator<RawScanView> for MemoryAcquisition {
    fn from_iter<I: IntoIterator<Item = RawScanView>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl AcquisitionSource for MemoryAcquisition {
    fn scan_count(&self) -> usize {
        self.scans.len()
    }

    fn first_scan_number(&self) -> usize {
        self.scans.keys().next().copied().unwrap_or(1)
    }

    fn last_scan_number(&self) -> usize {
        self.scans.keys().next_back().copied().unwrap_or(0)
    }

    fn get_scan(&mut self, scan_number: usize) -> Result<RawScanView, ScanAccessError> {
        self.scans
            .get(&scan_number)
            .cloned()
            .ok_or(ScanAccessError::ScanNotFound(scan_number))
    }
}
