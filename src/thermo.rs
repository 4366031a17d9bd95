//! Reading Thermo RAW files via the vendor's .NET RawFileReader library,
//! hosted in-process through the `thermorawfilereader` bindings.

use std::io;
use std::path::Path;

use thermorawfilereader::schema::{DissociationMethod, Polarity as ThermoPolarity};
use thermorawfilereader::RawFileReader;

use crate::scan::{ActivationType, Polarity, RawScanView};
use crate::source::{AcquisitionSource, ScanAccessError};

/// An [`AcquisitionSource`] backed by a Thermo RAW file. Scan numbers are the
/// instrument's 1-based acquisition numbers; the underlying reader indexes
/// from 0.
pub struct ThermoAcquisition {
    handle: RawFileReader,
}

impl ThermoAcquisition {
    /// Open a RAW file, requesting centroided spectra from the vendor library.
    pub fn open(path: &Path) -> io::Result<ThermoAcquisition> {
        let mut handle = RawFileReader::open(path)?;
        handle.set_centroid_spectra(true);
        Ok(ThermoAcquisition { handle })
    }
}

fn convert_activation(method: DissociationMethod) -> Option<ActivationType> {
    match method {
        DissociationMethod::CID => Some(ActivationType::Cid),
        DissociationMethod::HCD => Some(ActivationType::Hcd),
        DissociationMethod::ETD
        | DissociationMethod::ETHCD
        | DissociationMethod::ETCID => Some(ActivationType::Etd),
        DissociationMethod::ECD
        | DissociationMethod::ECCID
        | DissociationMethod::ECHCD => Some(ActivationType::Ecd),
        DissociationMethod::NETD => Some(ActivationType::Netd),
        DissociationMethod::MPD => Some(ActivationType::Mpd),
        _ => None,
    }
}

impl AcquisitionSource for ThermoAcquisition {
    fn scan_count(&self) -> usize {
        self.handle.len()
    }

    fn get_scan(&mut self, scan_number: usize) -> Result<RawScanView, ScanAccessError> {
        let raw = self
            .handle
            .get(scan_number.saturating_sub(1))
            .ok_or(ScanAccessError::ScanNotFound(scan_number))?;
        let view = raw.view();

        let mut scan = RawScanView {
            scan_number,
            ms_level: view.ms_level(),
            // the vendor library reports time in minutes
            retention_time: view.time() * 60.0,
            polarity: match view.polarity() {
                ThermoPolarity::Positive => Polarity::Positive,
                ThermoPolarity::Negative => Polarity::Negative,
                _ => Polarity::Unknown,
            },
            filter_text: view.filter_string().map(|s| s.to_string()).unwrap_or_default(),
            ..Default::default()
        };

        if let Some(vprec) = view.precursor() {
            scan.precursor_mz = Some(vprec.mz());
            scan.activation = convert_activation(vprec.activation().dissociation_method());
        }

        if let Some(data) = view.data() {
            if let (Some(mz), Some(intensity)) = (data.mz(), data.intensity()) {
                scan.mz_array = mz.iter().collect();
                scan.intensity_array = intensity.iter().map(f64::from).collect();
            }
        }

        if let (Some(first), Some(last)) = (scan.mz_array.first(), scan.mz_array.last()) {
            scan.low_mz = *first;
            scan.high_mz = *last;
        }
        // total ion current over the centroided peaks, not the instrument's
        // reported TIC, mirroring what ends up in the peak payload
        scan.total_ion_current = scan.intensity_array.iter().sum();
        if let Some((index, intensity)) = scan
            .intensity_array
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, v)| (i, *v))
        {
            scan.base_peak_mz = scan.mz_array[index];
            scan.base_peak_intensity = intensity;
        }

        Ok(scan)
    }
}
