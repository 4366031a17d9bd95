//! The streaming mzXML document writer: assembles MS1/MS2 scan trees in
//! write order, keeps the byte ledger exact, and emits the trailing index
//! and checksum scaffolding.

use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use log::warn;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::ledger::{ByteLedger, LINE_TERMINATOR, MS1_SCAN_INDENT, MS2_SCAN_INDENT};
use crate::scan::{format_retention_time, ScanKind, ScanRecord};

const BUFFER_SIZE: usize = 10000;

/**
The states a [`MzXmlWriter`] passes through while producing one document.
This is only necessary for the module consumer when determining where
something may have gone wrong.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriterState {
    /// The header may still be written; no MS1 scan has arrived yet
    AwaitingFirstMs1,
    /// An MS1 scan is pending and collecting MS2 children
    AccumulatingChildren,
    /// The terminal flush of the last pending MS1 scan
    Flushing,
    /// The index and `<sha1>` stub are on disk; only
    /// [`finalize`] may touch the document now
    Closed,
}

#[derive(Debug, Error)]
pub enum MzXmlWriterError {
    #[error("An IO error occurred while writing: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
    #[error("Invalid writer action while in state {0:?}")]
    InvalidActionError(WriterState),
}

pub type WriterResult = Result<(), MzXmlWriterError>;

/// The per-document header fields that vary between output files.
#[derive(Debug, Clone, Default)]
pub struct DocumentHeader {
    /// Number of target scans this document will contain
    pub scan_count: usize,
    /// Retention time of the first target scan, in seconds
    pub start_retention_time: f64,
    /// Retention time of the last target scan, in seconds
    pub end_retention_time: f64,
    /// File name (no directory) of the source acquisition
    pub source_file_name: String,
    /// Lowercase hex SHA-1 of the source acquisition, computed before opening it
    pub source_file_sha1: String,
    /// `NSI`, `ESI`, or `Unknown`, from the first target scan's filter tokens
    pub ionization_source: String,
    /// `FTMS`, `ITMS`, or `Unknown`, from the first target scan's filter tokens
    pub mass_analyzer: String,
}

impl DocumentHeader {
    fn to_xml(&self) -> String {
        let mut text = String::with_capacity(1024);
        text.push_str("<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\r\n");
        text.push_str(
            "<mzXML xmlns=\"http://sashimi.sourceforge.net/schema_revision/mzXML_3.1\"\r\n",
        );
        text.push_str(" xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\"\r\n");
        text.push_str(
            " xsi:schemaLocation=\"http://sashimi.sourceforge.net/schema_revision/mzXML_3.1 \
             http://sashimi.sourceforge.net/schema_revision/mzXML_3.1/mzXML_idx_3.1.xsd\" >\r\n",
        );
        text.push_str(&format!(
            " <msRun scanCount=\"{}\" startTime=\"{}\" endTime=\"{}\" >\r\n",
            self.scan_count,
            format_retention_time(self.start_retention_time),
            format_retention_time(self.end_retention_time),
        ));
        text.push_str(&format!(
            "  <parentFile fileName=\"{}\" fileType=\"RAWData\" fileSha1=\"{}\" />\r\n",
            self.source_file_name, self.source_file_sha1,
        ));
        text.push_str("  <msInstrument>\r\n");
        text.push_str("   <msManufacturer category=\"msManufacturer\" value=\"Thermo Finnigan\" />\r\n");
        text.push_str("   <msModel category=\"msModel\" value=\"unknown\" />\r\n");
        text.push_str(&format!(
            "   <msIonisation category=\"msIonisation\" value=\"{}\" />\r\n",
            self.ionization_source
        ));
        text.push_str(&format!(
            "   <msMassAnalyzer category=\"msMassAnalyzer\" value=\"{}\" />\r\n",
            self.mass_analyzer
        ));
        text.push_str("   <msDetector category=\"msDetector\" value=\"unknown\" />\r\n");
        text.push_str("   <software type=\"acquisition\" name=\"Xcalibur\" version=\"3.1.2279\" />\r\n");
        text.push_str("  </msInstrument>\r\n");
        text.push_str("  <dataProcessing centroided=\"1\" >\r\n");
        text.push_str(&format!(
            "   <software type=\"conversion\" name=\"{}\" version=\"{}\" />\r\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ));
        text.push_str("  </dataProcessing>");
        text
    }
}

/**
An indexed mzXML writer that serializes completed MS1 scan trees
immediately instead of materializing the document in memory.

The writer owns a fresh [`ByteLedger`] for its lifetime; offsets recorded
there are byte-exact against the stream, which is what makes the trailing
`<index>` usable for random access.
*/
#[derive(Debug)]
pub struct MzXmlWriter<W: Write> {
    handle: BufWriter<W>,
    ledger: ByteLedger,
    state: WriterState,
    pending: Option<ScanRecord>,
    scans_written: u64,
    orphans_dropped: u64,
}

impl<W: Write> MzXmlWriter<W> {
    /// Wrap a new [`std::io::Write`]-able type, constructing a new [`MzXmlWriter`]
    pub fn new(file: W) -> MzXmlWriter<W> {
        MzXmlWriter {
            handle: BufWriter::with_capacity(BUFFER_SIZE, file),
            ledger: ByteLedger::new(),
            state: WriterState::AwaitingFirstMs1,
            pending: None,
            scans_written: 0,
            orphans_dropped: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn ledger(&self) -> &ByteLedger {
        &self.ledger
    }

    /// Number of `<scan>` elements flushed so far.
    pub fn scans_written(&self) -> u64 {
        self.scans_written
    }

    /// Number of MS2 scans dropped because no MS1 parent preceded them.
    pub fn orphans_dropped(&self) -> u64 {
        self.orphans_dropped
    }

    fn write_line(&mut self, text: &str) -> io::Result<()> {
        self.handle.write_all(text.as_bytes())?;
        self.handle.write_all(LINE_TERMINATOR.as_bytes())
    }

    /// Emit the document prologue. Must happen before any scan is written.
    pub fn write_header(&mut self, header: &DocumentHeader) -> WriterResult {
        if self.state != WriterState::AwaitingFirstMs1 || self.ledger.byte_depth() != 0 {
            return Err(MzXmlWriterError::InvalidActionError(self.state));
        }
        let text = header.to_xml();
        self.ledger.advance(&text, false);
        self.write_line(&text)?;
        Ok(())
    }

    /// Feed the next target scan, in ascending source order. An MS1 scan
    /// flushes the previously pending one; an MS2 scan attaches to the
    /// pending MS1, or is dropped with a diagnostic when none exists.
    pub fn write_scan(&mut self, record: ScanRecord) -> WriterResult {
        if self.state >= WriterState::Flushing {
            return Err(MzXmlWriterError::InvalidActionError(self.state));
        }
        match record.kind {
            ScanKind::Ms1 { .. } => {
                self.flush_pending()?;
                self.pending = Some(record);
                self.state = WriterState::AccumulatingChildren;
            }
            ScanKind::Ms2 { .. } => match self.pending.as_mut() {
                Some(parent) => parent.add_child(record),
                None => {
                    warn!(
                        "Scan {} is an MS2 scan with no preceding MS1 scan in this document; dropping it",
                        record.source_scan_number
                    );
                    self.orphans_dropped += 1;
                }
            },
        }
        Ok(())
    }

    /// Serialize the pending MS1 scan tree: the parent element, every
    /// attached child in arrival order, then the closing tag. Output scan
    /// numbers are claimed here, in write order, so they form a contiguous
    /// run regardless of gaps in the source numbering.
    fn flush_pending(&mut self) -> WriterResult {
        let Some(parent) = self.pending.take() else {
            return Ok(());
        };

        let parent_number = self.ledger.next_scan_number();
        self.ledger.record_scan_start(parent_number, MS1_SCAN_INDENT);
        let mut text = parent.format_ms1_open(parent_number);
        self.ledger.advance(&text, true);
        self.scans_written += 1;

        for child in parent.children() {
            let child_number = self.ledger.next_scan_number();
            self.ledger.record_scan_start(child_number, MS2_SCAN_INDENT);
            let child_text = child.format_ms2(child_number);
            self.ledger.advance(&child_text, false);
            text.push_str(&child_text);
            text.push_str(LINE_TERMINATOR);
            self.scans_written += 1;
        }

        text.push_str("  </scan>");
        self.ledger.advance("  </scan>", false);
        self.write_line(&text)?;
        Ok(())
    }

    /**
    Close the document body: flush the last pending scan tree, end
    `</msRun>`, emit the `<index>` of every recorded scan offset, the
    `<indexOffset>`, and an unterminated `<sha1>` tag, then flush the
    stream. The digest itself is appended by [`finalize`] in a second pass.
    */
    pub fn close(&mut self) -> WriterResult {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        self.state = WriterState::Flushing;
        self.flush_pending()?;

        self.write_line(" </msRun>")?;
        // the index begins after "</msRun>" + CRLF and one space of indent
        let index_offset =
            self.ledger.byte_depth() + " </msRun>".len() as u64 + LINE_TERMINATOR.len() as u64 + 1;
        self.ledger.record_index_offset(index_offset);

        self.write_line(" <index name=\"scan\" >")?;
        let entries: Vec<_> = self.ledger.scan_entries().collect();
        for entry in entries {
            self.write_line(&format!(
                "  <offset id=\"{}\" >{}</offset>",
                entry.scan_number, entry.byte_depth
            ))?;
        }
        self.write_line(" </index>")?;
        self.write_line(&format!(" <indexOffset>{}</indexOffset>", index_offset))?;
        self.handle.write_all(b" <sha1>")?;
        self.handle.flush()?;
        self.state = WriterState::Closed;
        Ok(())
    }
}

/// Compute the lowercase hex SHA-1 digest of a file's bytes.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 65536];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(base16ct::lower::encode_string(&hasher.finalize()))
}

/**
The second pass of document finalization: hash everything written so far
(up to and including the open `<sha1>` tag), then append the digest and the
closing markers. The document must already have been [`close`](MzXmlWriter::close)d.
*/
pub fn finalize(document_path: &Path) -> WriterResult {
    let digest = hash_file(document_path)?;
    let mut handle = fs::OpenOptions::new().append(true).open(document_path)?;
    handle.write_all(digest.as_bytes())?;
    handle.write_all(b"</sha1>\r\n")?;
    handle.write_all(b"</mzXML>\r\n")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::{ActivationType, Polarity, PrecursorInfo, RawScanView};

    fn view(scan_number: usize, ms_level: u8, filter_text: &str) -> RawScanView {
        RawScanView {
            scan_number,
            ms_level,
            retention_time: scan_number as f64 * 1.5,
            polarity: Polarity::Positive,
            filter_text: filter_text.to_string(),
            mz_array: vec![300.0, 400.0],
            intensity_array: vec![10.0, 20.0],
            low_mz: 300.0,
            high_mz: 400.0,
            base_peak_mz: 400.0,
            base_peak_intensity: 20.0,
            total_ion_current: 30.0,
            ..Default::default()
        }
    }

    fn header() -> DocumentHeader {
        DocumentHeader {
            scan_count: 3,
            start_retention_time: 1.5,
            end_retention_time: 4.5,
            source_file_name: "acquisition.raw".to_string(),
            source_file_sha1: "0".repeat(40),
            ionization_source: "NSI".to_string(),
            mass_analyzer: "FTMS".to_string(),
        }
    }

    fn ms2_record(scan_number: usize) -> ScanRecord {
        let raw = view(scan_number, 2, "ITMS + c NSI cv=-45.00 d Full ms2 438.74@cid35.00");
        ScanRecord::ms2(
            &raw,
            PrecursorInfo {
                mz: 438.74,
                intensity: 12.5,
                activation: ActivationType::Cid,
                collision_energy: 35,
            },
        )
    }

    fn write_small_document() -> Vec<u8> {
        let mut writer = MzXmlWriter::new(Vec::new());
        writer.write_header(&header()).unwrap();
        writer
            .write_scan(ScanRecord::ms1(&view(1, 1, "FTMS + p NSI cv=-45.00 Full ms")))
            .unwrap();
        writer.write_scan(ms2_record(2)).unwrap();
        writer
            .write_scan(ScanRecord::ms1(&view(4, 1, "FTMS + p NSI cv=-45.00 Full ms")))
            .unwrap();
        writer.close().unwrap();
        writer.handle.into_inner().unwrap()
    }

    fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<u64> {
        let mut positions = Vec::new();
        let mut start = 0;
        while start + needle.len() <= haystack.len() {
            if &haystack[start..start + needle.len()] == needle {
                positions.push(start as u64);
            }
            start += 1;
        }
        positions
    }

    #[test]
    fn test_output_scan_numbers_are_renumbered() {
        let buffer = write_small_document();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("  <scan num=\"1\"\r\n"));
        assert!(text.contains("   <scan num=\"2\"\r\n"));
        assert!(text.contains("  <scan num=\"3\"\r\n"));
        // the source numbering (1, 2, 4) does not leak into the document
        assert!(!text.contains("num=\"4\""));
    }

    #[test]
    fn test_index_offsets_match_scan_positions() {
        let buffer = write_small_document();
        let scan_positions = find_all(&buffer, b"<scan num=");
        assert_eq!(scan_positions.len(), 3);

        let text = String::from_utf8(buffer.clone()).unwrap();
        let mut recorded = Vec::new();
        for line in text.lines() {
            let line = line.trim_start();
            if let Some(rest) = line.strip_prefix("<offset id=\"") {
                let (_, tail) = rest.split_once("\" >").unwrap();
                let depth: u64 = tail.strip_suffix("</offset>").unwrap().parse().unwrap();
                recorded.push(depth);
            }
        }
        assert_eq!(recorded, scan_positions);
    }

    #[test]
    fn test_index_offset_points_at_index_section() {
        let buffer = write_small_document();
        let index_positions = find_all(&buffer, b"<index name=\"scan\"");
        assert_eq!(index_positions.len(), 1);

        let text = String::from_utf8(buffer).unwrap();
        let tail = text.split("<indexOffset>").nth(1).unwrap();
        let declared: u64 = tail.split("</indexOffset>").next().unwrap().parse().unwrap();
        assert_eq!(declared, index_positions[0]);
    }

    #[test]
    fn test_document_ends_with_open_sha1_tag() {
        let buffer = write_small_document();
        assert!(buffer.ends_with(b" <sha1>"));
    }

    #[test]
    fn test_orphan_ms2_is_dropped() {
        let mut writer = MzXmlWriter::new(Vec::new());
        writer.write_header(&header()).unwrap();
        writer.write_scan(ms2_record(1)).unwrap();
        writer
            .write_scan(ScanRecord::ms1(&view(2, 1, "FTMS + p NSI cv=-45.00 Full ms")))
            .unwrap();
        writer.close().unwrap();
        assert_eq!(writer.orphans_dropped(), 1);
        assert_eq!(writer.scans_written(), 1);
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let mut writer = MzXmlWriter::new(Vec::new());
        writer.write_header(&header()).unwrap();
        writer.close().unwrap();
        let err = writer
            .write_scan(ScanRecord::ms1(&view(1, 1, "FTMS + p NSI cv=-45.00 Full ms")))
            .unwrap_err();
        assert!(matches!(
            err,
            MzXmlWriterError::InvalidActionError(WriterState::Closed)
        ));
    }

    #[test]
    fn test_finalize_appends_digest_of_everything_before_it() -> WriterResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run_-45.mzXML");
        {
            let file = fs::File::create(&path)?;
            let mut writer = MzXmlWriter::new(file);
            writer.write_header(&header())?;
            writer.write_scan(ScanRecord::ms1(&view(1, 1, "FTMS + p NSI cv=-45.00 Full ms")))?;
            writer.write_scan(ms2_record(2))?;
            writer.close()?;
        }
        finalize(&path)?;

        let content = fs::read(&path)?;
        let text = String::from_utf8(content.clone()).unwrap();
        assert!(text.ends_with("</sha1>\r\n</mzXML>\r\n"));

        let boundary = text.rfind(" <sha1>").unwrap() + " <sha1>".len();
        let declared = &text[boundary..boundary + 40];

        let mut hasher = Sha1::new();
        hasher.update(&content[..boundary]);
        let expected = base16ct::lower::encode_string(&hasher.finalize());
        assert_eq!(declared, expected);
        Ok(())
    }
}
