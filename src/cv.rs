//! FAIMS compensation voltage discovery and scan selection.
//!
//! The CV value for a scan lives only in its filter text, as a `cv=<float>`
//! token. Discovery walks the whole acquisition once to collect the distinct
//! values; selection walks it again per value to collect the matching scan
//! numbers. Both passes parse the identical token text, which is why the
//! selection tolerance can be as tight as [`f32::EPSILON`].

use std::collections::HashMap;

use log::warn;
use regex::Regex;

use crate::source::AcquisitionSource;

/// Why a scan's filter text did not yield a CV value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CvParseIssue {
    /// The filter text has no `cv=` token at all
    MissingToken,
    /// `cv=` is present but not followed by number-like characters
    MalformedToken,
    /// The token text after `cv=` did not parse as a float
    UnparsableNumber(String),
}

/// Matches filter strings of the form
/// `FTMS + p NSI cv=-45.00 Full ms` and
/// `ITMS + c NSI cv=-65.00 r d Full ms2 438.7423@cid35.00`,
/// keeping a per-file memory of which scans have already produced a warning
/// so that repeated offenders do not flood the log.
#[derive(Debug)]
pub struct CvMatcher {
    pattern: Regex,
    scan_warnings: HashMap<String, Vec<usize>>,
}

impl Default for CvMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CvMatcher {
    pub fn new() -> CvMatcher {
        CvMatcher {
            pattern: Regex::new(r"cv=([0-9.+-]+)").unwrap(),
            scan_warnings: HashMap::new(),
        }
    }

    /// Pull the CV value out of one filter line.
    pub fn parse_cv_value(&self, filter_text: &str) -> Result<f32, CvParseIssue> {
        if !filter_text.to_ascii_lowercase().contains("cv=") {
            return Err(CvParseIssue::MissingToken);
        }
        let captures = self
            .pattern
            .captures(filter_text)
            .ok_or(CvParseIssue::MalformedToken)?;
        let token = &captures[1];
        token
            .parse::<f32>()
            .map_err(|_| CvParseIssue::UnparsableNumber(token.to_string()))
    }

    /// Record one skipped scan for `file_key` and emit the warning unless that
    /// file has already warned too often. The first 10 occurrences always
    /// warn; after that only scan numbers divisible by 100 do.
    fn warn_rate_limited(&mut self, file_key: &str, scan_number: usize, message: String) {
        let scans = self.scan_warnings.entry(file_key.to_string()).or_default();
        scans.push(scan_number);
        if scans.len() < 10 || scan_number % 100 == 0 {
            warn!("{}", message);
        }
    }

    /// Walk every scan of the acquisition and collect the distinct CV values,
    /// ascending. Scans without a usable `cv=` token are skipped with a
    /// rate-limited warning keyed by `file_key`.
    pub fn discover_cv_values<S: AcquisitionSource + ?Sized>(
        &mut self,
        source: &mut S,
        file_key: &str,
    ) -> Vec<f32> {
        let mut cv_values: Vec<f32> = Vec::new();
        for scan_number in source.first_scan_number()..=source.last_scan_number() {
            let scan = match source.get_scan(scan_number) {
                Ok(scan) => scan,
                Err(err) => {
                    warn!("Scan {} not found; skipping ({})", scan_number, err);
                    continue;
                }
            };
            let cv_value = match self.parse_cv_value(&scan.filter_text) {
                Ok(value) => value,
                Err(CvParseIssue::MissingToken) => {
                    self.warn_rate_limited(
                        file_key,
                        scan_number,
                        format!("Scan {} does not contain cv=; skipping", scan_number),
                    );
                    continue;
                }
                Err(CvParseIssue::MalformedToken) => {
                    self.warn_rate_limited(
                        file_key,
                        scan_number,
                        format!(
                            "Scan {} has cv= in the filter text, but it is not followed by a number: {}",
                            scan_number, scan.filter_text
                        ),
                    );
                    continue;
                }
                Err(CvParseIssue::UnparsableNumber(token)) => {
                    self.warn_rate_limited(
                        file_key,
                        scan_number,
                        format!("Unable to parse the CV value for scan {}: {}", scan_number, token),
                    );
                    continue;
                }
            };
            if !cv_values.contains(&cv_value) {
                cv_values.push(cv_value);
            }
        }
        cv_values.sort_by(f32::total_cmp);
        cv_values
    }

    /// Collect, in ascending order, the scan numbers whose CV value matches
    /// `target`. No warnings are emitted here; discovery already reported
    /// every problem scan once.
    pub fn select_target_scans<S: AcquisitionSource + ?Sized>(
        &self,
        source: &mut S,
        target: f32,
    ) -> Vec<usize> {
        let mut target_scans = Vec::new();
        for scan_number in source.first_scan_number()..=source.last_scan_number() {
            let Ok(scan) = source.get_scan(scan_number) else {
                continue;
            };
            let Ok(cv_value) = self.parse_cv_value(&scan.filter_text) else {
                continue;
            };
            if (cv_value - target).abs() < f32::EPSILON {
                target_scans.push(scan_number);
            }
        }
        target_scans
    }
}
