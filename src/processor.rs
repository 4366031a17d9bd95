//! The acquisition-splitting pipeline: discover the compensation voltages in
//! a source file, then stream one indexed mzXML document per voltage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, error, info, warn};
use regex::Regex;
use thiserror::Error;

use crate::cv::CvMatcher;
use crate::peaks::round_to;
use crate::scan::{parse_activation, ActivationType, PrecursorInfo, RawScanView, ScanRecord};
use crate::source::{AcquisitionSource, ScanAccessError};
use crate::writer::{finalize, hash_file, DocumentHeader, MzXmlWriter, MzXmlWriterError};

/// How often to emit progress diagnostics while looping over scans.
const PROGRESS_INTERVAL_SECONDS: u64 = 3;

/// The largest distance between a reported precursor m/z and an MS1 peak for
/// the peak's intensity to count as the precursor intensity.
const PRECURSOR_MZ_TOLERANCE: f64 = 0.1;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("The file {0} could not be read: {1}")]
    IrrecoverableFileError(PathBuf, #[source] io::Error),
    #[error("The file {0} is not in a supported acquisition format")]
    UnsupportedFormat(PathBuf),
    #[error("An IO error occurred: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
    #[error("Failed to write an output document: {0}")]
    WriterError(
        #[from]
        #[source]
        MzXmlWriterError,
    ),
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;

/// Splits FAIMS acquisitions into one mzXML document per compensation
/// voltage. Holds the CV matcher so that per-file warning rate limiting
/// survives across a batch.
#[derive(Debug, Default)]
pub struct FaimsToMzXmlProcessor {
    cv_matcher: CvMatcher,
}

impl FaimsToMzXmlProcessor {
    pub fn new() -> FaimsToMzXmlProcessor {
        Self::default()
    }

    /**
    Split one acquisition into per-CV documents under `output_directory`.

    The source file is hashed before any scans are read so the digest can be
    embedded in every document's `<parentFile>` tag. Returns the paths of
    the documents created.
    */
    pub fn process_acquisition<S: AcquisitionSource + ?Sized>(
        &mut self,
        source: &mut S,
        acquisition_path: &Path,
        output_directory: &Path,
    ) -> ProcessingResult<Vec<PathBuf>> {
        debug!("Computing the SHA-1 hash of the source file");
        let source_hash = hash_file(acquisition_path)
            .map_err(|e| ProcessingError::IrrecoverableFileError(acquisition_path.into(), e))?;
        debug!("... {}", source_hash);

        let file_key = acquisition_path.to_string_lossy().to_string();
        let cv_values = self.cv_matcher.discover_cv_values(source, &file_key);
        if cv_values.is_empty() {
            warn!(
                "No compensation voltages found in {}; nothing to write",
                acquisition_path.display()
            );
            return Ok(Vec::new());
        }

        let base_name = acquisition_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "acquisition".to_string());
        let source_file_name = acquisition_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| base_name.clone());

        let total_scan_count = source.scan_count();
        let mut scans_processed = 0usize;
        let mut last_progress = Instant::now();
        let mut documents = Vec::with_capacity(cv_values.len());

        for cv_value in cv_values {
            let target_scans = self.cv_matcher.select_target_scans(source, cv_value);
            if target_scans.is_empty() {
                warn!(
                    "No scans matched CV {} in {}; skipping that document",
                    cv_value,
                    acquisition_path.display()
                );
                continue;
            }

            let document_path =
                output_directory.join(format!("{}_{}.mzXML", base_name, cv_value));
            debug!("Creating file {}", document_path.display());

            let header = self.build_header(source, &target_scans, &source_file_name, &source_hash);

            let handle = fs::File::create(&document_path)?;
            let mut writer = MzXmlWriter::new(handle);
            writer.write_header(&header)?;

            for &scan_number in &target_scans {
                if last_progress.elapsed().as_secs() >= PROGRESS_INTERVAL_SECONDS {
                    let percent_complete =
                        scans_processed as f64 / total_scan_count as f64 * 100.0;
                    debug!("... processing: {:.0}% complete", percent_complete);
                    last_progress = Instant::now();
                }

                let view = match source.get_scan(scan_number) {
                    Ok(view) => view,
                    Err(ScanAccessError::ScanNotFound(n)) => {
                        warn!("Scan {} not found; skipping", n);
                        continue;
                    }
                    Err(ScanAccessError::IOError(e)) => {
                        warn!("Scan {} could not be read; skipping: {}", scan_number, e);
                        continue;
                    }
                };

                match view.ms_level {
                    1 => writer.write_scan(ScanRecord::ms1(&view))?,
                    2 => {
                        let precursor = self.resolve_precursor(source, &view);
                        writer.write_scan(ScanRecord::ms2(&view, precursor))?;
                    }
                    // higher MS levels never carry a CV filter of their own
                    _ => {}
                }
                scans_processed += 1;
            }

            writer.close()?;
            drop(writer);
            finalize(&document_path)?;
            documents.push(document_path);
        }

        debug!("... processing: 100% complete");
        Ok(documents)
    }

    fn build_header<S: AcquisitionSource + ?Sized>(
        &mut self,
        source: &mut S,
        target_scans: &[usize],
        source_file_name: &str,
        source_hash: &str,
    ) -> DocumentHeader {
        let first = source.get_scan(target_scans[0]).ok();
        let last = source.get_scan(*target_scans.last().unwrap_or(&target_scans[0])).ok();

        let (ionization_source, mass_analyzer) = match &first {
            Some(view) => (
                detect_filter_token(&view.filter_text, &["NSI", "ESI"], "ionization source"),
                detect_filter_token(&view.filter_text, &["FTMS", "ITMS"], "mass analyzer"),
            ),
            None => ("Unknown".to_string(), "Unknown".to_string()),
        };

        DocumentHeader {
            scan_count: target_scans.len(),
            start_retention_time: first.map(|v| v.retention_time).unwrap_or_default(),
            end_retention_time: last.map(|v| v.retention_time).unwrap_or_default(),
            source_file_name: source_file_name.to_string(),
            source_file_sha1: source_hash.to_string(),
            ionization_source,
            mass_analyzer,
        }
    }

    /**
    Resolve the precursor of an MS2 scan against its parent MS1 spectrum.

    The parent is the nearest earlier MS1 scan in the source numbering,
    falling back to the first scan of the acquisition. The precursor
    intensity is taken from the parent's closest peak when that peak lies
    within [`PRECURSOR_MZ_TOLERANCE`] of the reported m/z, and 0 otherwise.
    */
    fn resolve_precursor<S: AcquisitionSource + ?Sized>(
        &mut self,
        source: &mut S,
        ms2_view: &RawScanView,
    ) -> PrecursorInfo {
        let precursor_mz = round_to(
            ms2_view
                .precursor_mz
                .unwrap_or_else(|| isolation_mz_from_filter(&ms2_view.filter_text)),
            8,
        );

        let intensity = self
            .find_parent_spectrum(source, ms2_view.scan_number)
            .map(|parent| closest_peak_intensity(&parent, precursor_mz))
            .unwrap_or(0.0);

        // the filter token is the only carrier of the collision energy, so it
        // is parsed even when the reader metadata already names the method
        let parsed = parse_activation(&ms2_view.filter_text);
        let collision_energy = parsed.as_ref().map(|(_, energy)| *energy).unwrap_or(0.0);
        let activation = match ms2_view.activation {
            Some(activation) => activation,
            None => match parsed {
                Some((Ok(activation), _)) => activation,
                Some((Err(unknown), _)) => {
                    warn!(
                        "Scan {}: {}; defaulting to HCD",
                        ms2_view.scan_number, unknown
                    );
                    ActivationType::Hcd
                }
                None => ActivationType::default(),
            },
        };

        PrecursorInfo {
            mz: precursor_mz,
            intensity,
            activation,
            collision_energy: collision_energy.round() as i32,
        }
    }

    fn find_parent_spectrum<S: AcquisitionSource + ?Sized>(
        &mut self,
        source: &mut S,
        ms2_scan_number: usize,
    ) -> Option<RawScanView> {
        let first = source.first_scan_number();
        let mut scan_number = ms2_scan_number;
        while scan_number > first {
            scan_number -= 1;
            if let Ok(view) = source.get_scan(scan_number) {
                if view.ms_level == 1 {
                    return Some(view);
                }
            }
        }
        source.get_scan(first).ok()
    }

    /**
    Process every acquisition matching `input_spec`, which may name a single
    file or carry `*`/`?` wildcards over one directory. Returns the number
    of files successfully processed; per-file failures are logged and do not
    abort the batch.
    */
    pub fn process_files(
        &mut self,
        input_spec: &str,
        output_directory: Option<&Path>,
    ) -> ProcessingResult<usize> {
        let matches = expand_input_spec(input_spec)?;
        if matches.is_empty() {
            warn!("No match was found for the input file path spec: {}", input_spec);
            return Ok(0);
        }

        let output_directory = output_directory
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_directory(input_spec));
        if !output_directory.exists() {
            info!("Creating missing output directory");
            fs::create_dir_all(&output_directory)?;
        }

        let mut processed = 0usize;
        for path in matches {
            info!("Processing {}", path.display());
            match self.process_file(&path, &output_directory) {
                Ok(documents) => {
                    info!(
                        "Wrote {} document(s) for {}",
                        documents.len(),
                        path.display()
                    );
                    processed += 1;
                }
                Err(e) => {
                    error!("Error processing {}: {}", path.display(), e);
                }
            }
        }
        Ok(processed)
    }

    fn process_file(
        &mut self,
        path: &Path,
        output_directory: &Path,
    ) -> ProcessingResult<Vec<PathBuf>> {
        let mut source = open_acquisition(path)?;
        self.process_acquisition(source.as_mut(), path, output_directory)
    }
}

/// Open a raw acquisition file as a scan source.
pub fn open_acquisition(path: &Path) -> ProcessingResult<Box<dyn AcquisitionSource>> {
    let is_raw = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("raw"))
        .unwrap_or(false);
    if !is_raw {
        return Err(ProcessingError::UnsupportedFormat(path.into()));
    }
    #[cfg(feature = "thermo")]
    {
        let source = crate::thermo::ThermoAcquisition::open(path)?;
        Ok(Box::new(source))
    }
    #[cfg(not(feature = "thermo"))]
    {
        Err(ProcessingError::UnsupportedFormat(path.into()))
    }
}

fn closest_peak_intensity(parent: &RawScanView, precursor_mz: f64) -> f64 {
    let mut best: Option<(f64, f64)> = None;
    for (mz, intensity) in parent.mz_array.iter().zip(parent.intensity_array.iter()) {
        let distance = (mz - precursor_mz).abs();
        if best.map(|(d, _)| distance < d).unwrap_or(true) {
            best = Some((distance, *intensity));
        }
    }
    match best {
        Some((distance, intensity)) if distance <= PRECURSOR_MZ_TOLERANCE => {
            round_to(intensity, 2)
        }
        _ => 0.0,
    }
}

fn detect_filter_token(filter_text: &str, candidates: &[&str], label: &str) -> String {
    for token in filter_text.split_ascii_whitespace() {
        if candidates.contains(&token) {
            return token.to_string();
        }
    }
    warn!(
        "Unrecognized {}; filter line does not contain {}: {}",
        label,
        candidates.join(" or "),
        filter_text
    );
    "Unknown".to_string()
}

/// Pull the isolation m/z out of a filter line's `<mz>@<activation>` token.
fn isolation_mz_from_filter(filter_text: &str) -> f64 {
    for token in filter_text.split_ascii_whitespace() {
        if let Some((mz_text, _)) = token.split_once('@') {
            if let Ok(mz) = mz_text.parse::<f64>() {
                return mz;
            }
        }
    }
    0.0
}

/// Output lands next to the input unless a directory is given explicitly.
fn default_output_directory(input_spec: &str) -> PathBuf {
    match Path::new(input_spec).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn expand_input_spec(input_spec: &str) -> io::Result<Vec<PathBuf>> {
    let spec_path = Path::new(input_spec);
    let name_spec = spec_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    if !name_spec.contains('*') && !name_spec.contains('?') {
        return Ok(if spec_path.exists() {
            vec![spec_path.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let directory = match spec_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let pattern = format!(
        "^{}$",
        regex::escape(&name_spec).replace(r"\*", ".*").replace(r"\?", ".")
    );
    let matcher = Regex::new(&pattern).unwrap();

    let mut matches = Vec::new();
    for entry in fs::read_dir(&directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if matcher.is_match(&entry.file_name().to_string_lossy()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scan::Polarity;
    use crate::source::MemoryAcquisition;
    use std::io::Write;

    fn ms1_view(scan_number: usize, cv: &str, mz_array: Vec<f64>, intensity_array: Vec<f64>) -> RawScanView {
        RawScanView {
            scan_number,
            ms_level: 1,
            retention_time: scan_number as f64 * 2.0,
            polarity: Polarity::Positive,
            filter_text: format!("FTMS + p NSI cv={} Full ms [350.0000-1800.0000]", cv),
            low_mz: mz_array.first().copied().unwrap_or_default(),
            high_mz: mz_array.last().copied().unwrap_or_default(),
            base_peak_mz: mz_array.first().copied().unwrap_or_default(),
            base_peak_intensity: intensity_array.first().copied().unwrap_or_default(),
            total_ion_current: intensity_array.iter().sum(),
            mz_array,
            intensity_array,
            ..Default::default()
        }
    }

    fn ms2_view(scan_number: usize, cv: &str, precursor_mz: f64) -> RawScanView {
        RawScanView {
            scan_number,
            ms_level: 2,
            retention_time: scan_number as f64 * 2.0,
            polarity: Polarity::Positive,
            filter_text: format!(
                "ITMS + c NSI cv={} d Full ms2 {}@hcd32.00 [110.0000-1800.0000]",
                cv, precursor_mz
            ),
            precursor_mz: Some(precursor_mz),
            mz_array: vec![150.0, 250.0],
            intensity_array: vec![5.0, 6.0],
            low_mz: 150.0,
            high_mz: 250.0,
            base_peak_mz: 250.0,
            base_peak_intensity: 6.0,
            total_ion_current: 11.0,
            ..Default::default()
        }
    }

    fn two_cv_acquisition() -> MemoryAcquisition {
        vec![
            ms1_view(1, "-45.00", vec![438.5, 440.0], vec![100.0, 50.0]),
            ms2_view(2, "-45.00", 438.52),
            ms1_view(3, "-65.00", vec![512.0], vec![75.0]),
            ms2_view(4, "-65.00", 512.01),
            ms1_view(5, "-45.00", vec![438.5], vec![90.0]),
        ]
        .into_iter()
        .collect()
    }

    fn write_source_file(dir: &Path) -> PathBuf {
        let path = dir.join("run01.raw");
        let mut handle = fs::File::create(&path).unwrap();
        handle.write_all(b"raw acquisition bytes").unwrap();
        path
    }

    #[test_log::test]
    fn test_one_document_per_cv() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = write_source_file(dir.path());
        let mut source = two_cv_acquisition();

        let mut processor = FaimsToMzXmlProcessor::new();
        let documents = processor
            .process_acquisition(&mut source, &raw_path, dir.path())
            .unwrap();

        let names: Vec<_> = documents
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["run01_-65.mzXML", "run01_-45.mzXML"]);
        for path in &documents {
            assert!(path.is_file());
        }
    }

    #[test]
    fn test_document_content_is_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = write_source_file(dir.path());
        let mut source = two_cv_acquisition();

        let mut processor = FaimsToMzXmlProcessor::new();
        let documents = processor
            .process_acquisition(&mut source, &raw_path, dir.path())
            .unwrap();

        let minus45 = documents.iter().find(|p| {
            p.file_name().unwrap().to_string_lossy().contains("-45")
        });
        let text = fs::read_to_string(minus45.unwrap()).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\r\n"));
        assert!(text.contains(" <msRun scanCount=\"3\" startTime=\"PT2S\" endTime=\"PT10S\" >"));
        assert!(text.contains("fileName=\"run01.raw\""));
        assert!(text.contains("value=\"NSI\""));
        assert!(text.contains("value=\"FTMS\""));
        // scans renumbered contiguously within the document
        assert!(text.contains("  <scan num=\"1\"\r\n"));
        assert!(text.contains("   <scan num=\"2\"\r\n"));
        assert!(text.contains("  <scan num=\"3\"\r\n"));
        // the CV token is stripped from emitted filter lines
        assert!(!text.contains("filterLine=\"FTMS + p NSI cv="));
        assert!(text.ends_with("</sha1>\r\n</mzXML>\r\n"));
    }

    #[test]
    fn test_precursor_intensity_from_parent_peak() {
        let mut source = two_cv_acquisition();
        let mut processor = FaimsToMzXmlProcessor::new();

        let view = source.get_scan(2).unwrap();
        let precursor = processor.resolve_precursor(&mut source, &view);
        assert_eq!(precursor.mz, 438.52);
        assert_eq!(precursor.intensity, 100.0);
        assert_eq!(precursor.activation, ActivationType::Hcd);
        assert_eq!(precursor.collision_energy, 32);
    }

    #[test]
    fn test_metadata_activation_keeps_filter_energy() {
        let mut source = two_cv_acquisition();
        let mut processor = FaimsToMzXmlProcessor::new();

        // readers that report the dissociation method still leave the
        // collision energy to the filter token
        let mut view = source.get_scan(2).unwrap();
        view.activation = Some(ActivationType::Hcd);
        let precursor = processor.resolve_precursor(&mut source, &view);
        assert_eq!(precursor.activation, ActivationType::Hcd);
        assert_eq!(precursor.collision_energy, 32);

        // metadata wins over the filter token for the method itself
        view.activation = Some(ActivationType::Etd);
        let precursor = processor.resolve_precursor(&mut source, &view);
        assert_eq!(precursor.activation, ActivationType::Etd);
        assert_eq!(precursor.collision_energy, 32);
    }

    #[test]
    fn test_precursor_intensity_zero_when_no_nearby_peak() {
        let mut source: MemoryAcquisition = vec![
            ms1_view(1, "-45.00", vec![900.0], vec![40.0]),
            ms2_view(2, "-45.00", 438.52),
        ]
        .into_iter()
        .collect();

        let mut processor = FaimsToMzXmlProcessor::new();
        let view = source.get_scan(2).unwrap();
        let precursor = processor.resolve_precursor(&mut source, &view);
        assert_eq!(precursor.intensity, 0.0);
    }

    /// Serves scans from memory but fails one scan with an IO error on its
    /// n-th access, so that the failure lands in a chosen processing pass.
    struct FlakyAcquisition {
        inner: MemoryAcquisition,
        failing_scan: usize,
        fail_on_access: usize,
        accesses: usize,
    }

    impl AcquisitionSource for FlakyAcquisition {
        fn scan_count(&self) -> usize {
            self.inner.scan_count()
        }

        fn first_scan_number(&self) -> usize {
            self.inner.first_scan_number()
        }

        fn last_scan_number(&self) -> usize {
            self.inner.last_scan_number()
        }

        fn get_scan(&mut self, scan_number: usize) -> Result<RawScanView, ScanAccessError> {
            if scan_number == self.failing_scan {
                self.accesses += 1;
                if self.accesses == self.fail_on_access {
                    return Err(ScanAccessError::IOError(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "device timeout",
                    )));
                }
            }
            self.inner.get_scan(scan_number)
        }
    }

    #[test]
    fn test_scan_read_failure_skips_scan_only() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = write_source_file(dir.path());
        // scan 2 survives discovery and selection, then fails while the
        // document is being written (its third access)
        let mut source = FlakyAcquisition {
            inner: MemoryAcquisition::new([
                ms1_view(1, "-45.00", vec![438.5], vec![100.0]),
                ms1_view(2, "-45.00", vec![440.0], vec![80.0]),
                ms1_view(3, "-45.00", vec![441.0], vec![60.0]),
            ]),
            failing_scan: 2,
            fail_on_access: 3,
            accesses: 0,
        };

        let mut processor = FaimsToMzXmlProcessor::new();
        let documents = processor
            .process_acquisition(&mut source, &raw_path, dir.path())
            .unwrap();
        assert_eq!(documents.len(), 1);

        let text = fs::read_to_string(&documents[0]).unwrap();
        assert!(text.contains("  <scan num=\"1\"\r\n"));
        assert!(text.contains("  <scan num=\"2\"\r\n"));
        assert!(!text.contains("<scan num=\"3\""));
        assert!(text.ends_with("</sha1>\r\n</mzXML>\r\n"));
    }

    #[test]
    fn test_default_output_directory_is_input_directory() {
        assert_eq!(
            default_output_directory("/data/runs/run01.raw"),
            PathBuf::from("/data/runs")
        );
        assert_eq!(default_output_directory("/data/runs/*.raw"), PathBuf::from("/data/runs"));
        assert_eq!(default_output_directory("run01.raw"), PathBuf::from("."));
    }

    #[test]
    fn test_empty_acquisition_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = write_source_file(dir.path());
        let mut source: MemoryAcquisition = vec![ms1_view(1, "", vec![400.0], vec![1.0])]
            .into_iter()
            .map(|mut v| {
                v.filter_text = "FTMS + p NSI Full ms [350.0000-1800.0000]".to_string();
                v
            })
            .collect();

        let mut processor = FaimsToMzXmlProcessor::new();
        let documents = processor
            .process_acquisition(&mut source, &raw_path, dir.path())
            .unwrap();
        assert!(documents.is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_expand_input_spec_wildcards() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a1.raw", "a2.raw", "b1.raw", "a1.mzXML"] {
            fs::File::create(dir.path().join(name)).unwrap();
        }

        let spec = dir.path().join("a*.raw");
        let matches = expand_input_spec(&spec.to_string_lossy()).unwrap();
        let names: Vec<_> = matches
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a1.raw", "a2.raw"]);

        let spec = dir.path().join("a?.raw");
        assert_eq!(expand_input_spec(&spec.to_string_lossy()).unwrap().len(), 2);
    }

    #[test]
    fn test_detect_filter_token() {
        assert_eq!(
            detect_filter_token("FTMS + p NSI Full ms", &["NSI", "ESI"], "ionization source"),
            "NSI"
        );
        assert_eq!(
            detect_filter_token("FTMS + p Full ms", &["NSI", "ESI"], "ionization source"),
            "Unknown"
        );
    }
}
