//! The normalized in-memory scan model: the raw view handed over by an
//! acquisition reader, and the derived records the document assembler owns
//! while it streams scans out.

use std::fmt::{self, Display, Write};
use std::str::FromStr;

use crate::peaks::{format_special_number, round_to, PeakPayload};

/// Scan polarity as reported by the instrument.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
    #[default]
    Unknown,
}

impl Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // anything that is not positive renders as "-"
        match self {
            Polarity::Positive => f.write_str("+"),
            Polarity::Negative | Polarity::Unknown => f.write_str("-"),
        }
    }
}

/// The scan type tag derived from the filter text tokens.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Full,
    Sim,
    #[default]
    Unknown,
}

impl ScanType {
    /// Look for a whole `Full` or `SIM` token in the filter text.
    pub fn from_filter_text(filter_text: &str) -> ScanType {
        for token in filter_text.split_ascii_whitespace() {
            match token {
                "Full" => return ScanType::Full,
                "SIM" => return ScanType::Sim,
                _ => {}
            }
        }
        ScanType::Unknown
    }
}

impl Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanType::Full => f.write_str("Full"),
            ScanType::Sim => f.write_str("SIM"),
            ScanType::Unknown => f.write_str("Unknown"),
        }
    }
}

/// The dissociation method used to produce an MS2 scan.
///
/// When the instrument metadata does not carry one, it is parsed from the
/// `@<method><energy>` filter token, and failing that the converter assumes
/// beam-type collisional dissociation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ActivationType {
    Cid,
    #[default]
    Hcd,
    Etd,
    Ecd,
    Pqd,
    Mpd,
    Netd,
    Uvpd,
}

impl Display for ActivationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActivationType::Cid => "CID",
            ActivationType::Hcd => "HCD",
            ActivationType::Etd => "ETD",
            ActivationType::Ecd => "ECD",
            ActivationType::Pqd => "PQD",
            ActivationType::Mpd => "MPD",
            ActivationType::Netd => "NETD",
            ActivationType::Uvpd => "UVPD",
        };
        f.write_str(label)
    }
}

impl FromStr for ActivationType {
    type Err = UnknownActivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CID" => Ok(ActivationType::Cid),
            "HCD" => Ok(ActivationType::Hcd),
            "ETD" => Ok(ActivationType::Etd),
            "ECD" => Ok(ActivationType::Ecd),
            "PQD" => Ok(ActivationType::Pqd),
            "MPD" => Ok(ActivationType::Mpd),
            "NETD" => Ok(ActivationType::Netd),
            "UVPD" => Ok(ActivationType::Uvpd),
            _ => Err(UnknownActivationError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Unrecognized activation method {0:?}")]
pub struct UnknownActivationError(pub String);

/// One scan as yielded by an [`AcquisitionSource`](crate::source::AcquisitionSource).
///
/// Retention time is in seconds. The m/z array is ordered ascending by
/// acquisition convention and parallel to the intensity array.
#[derive(Debug, Default, Clone)]
pub struct RawScanView {
    pub scan_number: usize,
    pub ms_level: u8,
    pub retention_time: f64,
    pub polarity: Polarity,
    pub filter_text: String,
    /// The parent ion m/z, present for MS2 scans
    pub precursor_mz: Option<f64>,
    /// The dissociation method, when the instrument metadata reports one
    pub activation: Option<ActivationType>,
    pub mz_array: Vec<f64>,
    pub intensity_array: Vec<f64>,
    pub low_mz: f64,
    pub high_mz: f64,
    pub base_peak_mz: f64,
    pub base_peak_intensity: f64,
    pub total_ion_current: f64,
}

/// The precursor description attached to an MS2 [`ScanRecord`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PrecursorInfo {
    pub mz: f64,
    pub intensity: f64,
    pub activation: ActivationType,
    pub collision_energy: i32,
}

impl PrecursorInfo {
    /// Render the `<precursorMz>` element, without a trailing line terminator.
    pub fn to_xml(&self) -> String {
        format!(
            "    <precursorMz precursorIntensity=\"{}\" activationMethod=\"{}\" >{}</precursorMz>",
            self.intensity, self.activation, self.mz
        )
    }
}

/// Whether a [`ScanRecord`] is a parent MS1 scan that owns its MS2 children
/// outright, or an MS2 child with a resolved precursor.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanKind {
    Ms1 { children: Vec<ScanRecord> },
    Ms2 { precursor: PrecursorInfo },
}

/// A scan normalized for serialization, owned by the assembler for the
/// lifetime of one output document. The filter line is already sanitized and
/// the peak arrays already encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub source_scan_number: usize,
    pub ms_level: u8,
    pub peaks_count: usize,
    pub polarity: Polarity,
    pub scan_type: ScanType,
    pub filter_line: String,
    pub retention_time: String,
    pub low_mz: f64,
    pub high_mz: f64,
    pub base_peak_mz: f64,
    pub base_peak_intensity: f64,
    pub total_ion_current: f64,
    pub payload: PeakPayload,
    pub kind: ScanKind,
}

impl ScanRecord {
    /// Build an MS1 record from a raw scan view, with an empty child list.
    pub fn ms1(view: &RawScanView) -> ScanRecord {
        Self::build(view, ScanKind::Ms1 { children: Vec::new() })
    }

    /// Build an MS2 record from a raw scan view and its resolved precursor.
    pub fn ms2(view: &RawScanView, precursor: PrecursorInfo) -> ScanRecord {
        Self::build(view, ScanKind::Ms2 { precursor })
    }

    fn build(view: &RawScanView, kind: ScanKind) -> ScanRecord {
        let peaks_count = view.mz_array.len();
        let strip_trigger = matches!(kind, ScanKind::Ms2 { .. });
        let (low_mz, high_mz, base_peak_mz, base_peak_intensity) = if peaks_count == 0 {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            (
                view.low_mz,
                view.high_mz,
                view.base_peak_mz,
                view.base_peak_intensity,
            )
        };
        ScanRecord {
            source_scan_number: view.scan_number,
            ms_level: view.ms_level,
            peaks_count,
            polarity: view.polarity,
            scan_type: ScanType::from_filter_text(&view.filter_text),
            filter_line: sanitize_filter_line(&view.filter_text, strip_trigger),
            retention_time: format_retention_time(view.retention_time),
            low_mz,
            high_mz,
            base_peak_mz,
            base_peak_intensity,
            total_ion_current: view.total_ion_current,
            payload: PeakPayload::encode(&view.mz_array, &view.intensity_array),
            kind,
        }
    }

    /// Attach an MS2 child to this MS1 record. Children are serialized in
    /// arrival order when the parent is flushed.
    pub fn add_child(&mut self, child: ScanRecord) {
        match &mut self.kind {
            ScanKind::Ms1 { children } => children.push(child),
            ScanKind::Ms2 { .. } => {
                unreachable!("MS2 scans cannot own children")
            }
        }
    }

    pub fn children(&self) -> &[ScanRecord] {
        match &self.kind {
            ScanKind::Ms1 { children } => children,
            ScanKind::Ms2 { .. } => &[],
        }
    }

    /// Render the opening of an MS1 `<scan>` element through its `<peaks>`
    /// child, ending with a line terminator. Children and the closing tag are
    /// appended separately so the byte ledger can record their offsets.
    pub fn format_ms1_open(&self, output_scan_number: u64) -> String {
        let mut text = String::new();
        let _ = write!(
            text,
            "  <scan num=\"{}\"\r\n\
             \x20  msLevel=\"{}\"\r\n\
             \x20  peaksCount=\"{}\"\r\n\
             \x20  polarity=\"{}\"\r\n\
             \x20  scanType=\"{}\"\r\n\
             \x20  filterLine=\"{}\"\r\n\
             \x20  retentionTime=\"{}\"\r\n\
             \x20  lowMz=\"{}\"\r\n\
             \x20  highMz=\"{}\"\r\n\
             \x20  basePeakMz=\"{}\"\r\n\
             \x20  basePeakIntensity=\"{}\"\r\n\
             \x20  totIonCurrent=\"{}\">\r\n",
            output_scan_number,
            self.ms_level,
            self.peaks_count,
            self.polarity,
            self.scan_type,
            self.filter_line,
            self.retention_time,
            round_to(self.low_mz, 3),
            round_to(self.high_mz, 3),
            round_to(self.base_peak_mz, 3),
            format_special_number(self.base_peak_intensity),
            format_special_number(self.total_ion_current),
        );
        text.push_str(&self.payload.to_xml(3));
        text.push_str("\r\n");
        text
    }

    /// Render a complete MS2 `<scan>` element, without a trailing line
    /// terminator.
    pub fn format_ms2(&self, output_scan_number: u64) -> String {
        let precursor = match &self.kind {
            ScanKind::Ms2 { precursor } => precursor,
            ScanKind::Ms1 { .. } => unreachable!("MS1 scans are not serialized as children"),
        };
        let mut text = String::new();
        let _ = write!(
            text,
            "   <scan num=\"{}\"\r\n\
             \x20   msLevel=\"{}\"\r\n\
             \x20   peaksCount=\"{}\"\r\n\
             \x20   polarity=\"{}\"\r\n\
             \x20   scanType=\"{}\"\r\n\
             \x20   filterLine=\"{}\"\r\n\
             \x20   retentionTime=\"{}\"\r\n\
             \x20   lowMz=\"{}\"\r\n\
             \x20   highMz=\"{}\"\r\n\
             \x20   basePeakMz=\"{}\"\r\n\
             \x20   basePeakIntensity=\"{}\"\r\n\
             \x20   totIonCurrent=\"{}\"\r\n\
             \x20   collisionEnergy=\"{}\" >\r\n",
            output_scan_number,
            self.ms_level,
            self.peaks_count,
            self.polarity,
            self.scan_type,
            self.filter_line,
            self.retention_time,
            round_to(self.low_mz, 3),
            round_to(self.high_mz, 3),
            round_to(self.base_peak_mz, 3),
            format_special_number(self.base_peak_intensity),
            format_special_number(self.total_ion_current),
            precursor.collision_energy,
        );
        text.push_str(&precursor.to_xml());
        text.push_str("\r\n");
        text.push_str(&self.payload.to_xml(4));
        text.push_str("\r\n");
        text.push_str("   </scan>");
        text
    }
}

/// Format a retention time in seconds as an XML duration, rounded to 8
/// decimal places: `PT350.25S`.
pub fn format_retention_time(seconds: f64) -> String {
    format!("PT{}S", round_to(seconds, 8))
}

/// Drop the `cv=` token from a filter line, and for MS2 scans the standalone
/// `t` trigger token as well, collapsing runs of whitespace.
pub fn sanitize_filter_line(filter_text: &str, strip_trigger: bool) -> String {
    filter_text
        .split_ascii_whitespace()
        .filter(|token| !token.contains("cv=") && !(strip_trigger && *token == "t"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract the activation method and collision energy from the
/// `<mz>@<method><energy>` token of an MS2 filter line, e.g.
/// `438.7423@cid35.00` yields (CID, 35).
pub fn parse_activation(filter_text: &str) -> Option<(Result<ActivationType, UnknownActivationError>, f64)> {
    for token in filter_text.split_ascii_whitespace() {
        let Some((_, suffix)) = token.split_once('@') else {
            continue;
        };
        let boundary = suffix.find(|c: char| c.is_ascii_digit())?;
        let method = suffix[..boundary].parse::<ActivationType>();
        let energy = suffix[boundary..].parse::<f64>().ok()?;
        return Some((method, energy));
    }
    None
}
