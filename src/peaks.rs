//! Binary peak payload encoding for mzXML `<peaks>` elements, plus the
//! numeric formatting rules its attribute values use.

/// The encoded peak list of one scan: interleaved (m/z, intensity) pairs as
/// big-endian 32-bit floats, base64 encoded.
///
/// The precision, byte order, and compression attributes are fixed by the
/// converter and are carried here so the element can be serialized without
/// consulting any other state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeakPayload {
    pub precision: u8,
    pub byte_order: &'static str,
    pub content_type: &'static str,
    pub compression_type: &'static str,
    pub compressed_len: usize,
    pub encoded_data: String,
}

impl Default for PeakPayload {
    fn default() -> Self {
        Self {
            precision: 32,
            byte_order: "network",
            content_type: "m/z-int",
            compression_type: "none",
            compressed_len: 0,
            encoded_data: String::new(),
        }
    }
}

impl PeakPayload {
    /// Encode parallel m/z and intensity arrays. Values are narrowed to
    /// 32-bit floats and serialized big-endian, pairwise. An empty input
    /// produces an empty base64 string.
    pub fn encode(mz_array: &[f64], intensity_array: &[f64]) -> PeakPayload {
        let mut buffer: Vec<u8> = Vec::with_capacity(mz_array.len() * 8);
        for (mz, intensity) in mz_array.iter().zip(intensity_array.iter()) {
            buffer.extend_from_slice(&(*mz as f32).to_be_bytes());
            buffer.extend_from_slice(&(*intensity as f32).to_be_bytes());
        }
        PeakPayload {
            encoded_data: base64_simd::STANDARD.encode_to_string(&buffer),
            ..Default::default()
        }
    }

    /// Render the `<peaks>` element with its attributes one per line, indented
    /// by `indent` spaces. The returned text has no trailing line terminator.
    pub fn to_xml(&self, indent: usize) -> String {
        let pad = " ".repeat(indent);
        format!(
            "{pad}<peaks precision=\"{}\"\r\n\
             {pad} byteOrder=\"{}\"\r\n\
             {pad} contentType=\"{}\"\r\n\
             {pad} compressionType=\"{}\"\r\n\
             {pad} compressedLen=\"{}\" >{}</peaks>",
            self.precision,
            self.byte_order,
            self.content_type,
            self.compression_type,
            self.compressed_len,
            self.encoded_data,
        )
    }
}

/// Round `value` to `digits` decimal places.
pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Format a floating point attribute value for the intensity attributes:
/// values below one million print as plain decimal text, larger values use a
/// fixed-width scientific notation with an irregular zero-padding rule.
///
/// `2_500_000.0` renders as `2.5e+006`, while `25_000_000_000.0` (exponent 10)
/// renders as `2.5e+010`. Downstream consumers string-match this format, so
/// the padding break at exponent 10 is deliberate.
pub fn format_special_number(value: f64) -> String {
    if value < 1_000_000.0 {
        return format!("{}", value);
    }
    let exponent = value.log10().floor() as i32;
    let mantissa = round_to(value / 10f64.powi(exponent), 5);
    if exponent < 10 {
        format!("{}e+00{}", mantissa, exponent)
    } else {
        format!("{}e+0{}", mantissa, exponent)
    }
}
