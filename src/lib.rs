//! Split FAIMS Thermo acquisitions into one indexed mzXML document per
//! compensation voltage.
//!
//! A FAIMS run interleaves scans acquired at several compensation voltages
//! (CVs). Downstream mzXML consumers expect one voltage per file, so this
//! crate discovers the CV values present in an acquisition, selects each
//! voltage's scans, and streams them into standalone mzXML 3.1 documents
//! complete with a trailing scan index and SHA-1 checksum.

pub mod cv;
pub mod ledger;
pub mod peaks;
pub mod processor;
pub mod scan;
pub mod source;
#[cfg(feature = "thermo")]
pub mod thermo;
pub mod writer;

pub use crate::cv::CvMatcher;
pub use crate::processor::{FaimsToMzXmlProcessor, ProcessingError};
pub use crate::scan::{RawScanView, ScanRecord};
pub use crate::source::{AcquisitionSource, MemoryAcquisition};
pub use crate::writer::{DocumentHeader, MzXmlWriter};
