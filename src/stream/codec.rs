//! IQ sample encodings.
//!
//! All three encodings share one logical domain: complex samples whose I and
//! Q components are signed 12-bit integers in `[-2048, 2047]`. The canonical
//! in-memory form is `Complex<i16>`.
//!
//! | Format     | Bytes/sample | Layout                                            |
//! |------------|--------------|---------------------------------------------------|
//! | `Float32`  | 8            | I, Q as little-endian `f32`, scaled by 1/2048     |
//! | `I12In16`  | 4            | I, Q as little-endian `i16`                       |
//! | `Packed12` | 3            | `I[7:0]`, `Q[3:0] I[11:8]`, `Q[11:4]`             |
//!
//! Two packed samples occupy three 16-bit words, 25% less than `I12In16`.
//! Every encoding round-trips every representable sample exactly.

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{LmsError, Result};

/// Smallest 12-bit component value.
pub const I12_MIN: i16 = -2048;
/// Largest 12-bit component value.
pub const I12_MAX: i16 = 2047;
/// Full-scale divisor for the float encoding.
pub const FLOAT_SCALE: f32 = 2048.0;

/// Sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Two IEEE-754 singles per sample.
    Float32,
    /// Each component in its own 16-bit slot.
    #[default]
    I12In16,
    /// Two components packed into three bytes.
    Packed12,
}

impl SampleFormat {
    /// Encoded size of one complex sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Float32 => 8,
            Self::I12In16 => 4,
            Self::Packed12 => 3,
        }
    }

    /// Encoding used on the board link for a stream in this host format.
    pub fn link_format(self) -> Self {
        match self {
            Self::Packed12 => Self::Packed12,
            Self::Float32 | Self::I12In16 => Self::I12In16,
        }
    }

    /// Encoded length of `samples` samples.
    pub fn encoded_len(self, samples: usize) -> usize {
        samples * self.bytes_per_sample()
    }
}

/// Clamp to the 12-bit range.
#[inline]
pub fn clamp12(value: i16) -> i16 {
    value.clamp(I12_MIN, I12_MAX)
}

/// Sign-extend the low 12 bits.
#[inline]
fn sign_extend12(raw: u16) -> i16 {
    ((raw << 4) as i16) >> 4
}

/// Append the encoding of `samples` to `out`. Components are clamped to 12 bits.
pub fn encode(format: SampleFormat, samples: &[Complex<i16>], out: &mut Vec<u8>) {
    out.reserve(format.encoded_len(samples.len()));
    match format {
        SampleFormat::Float32 => {
            for s in samples {
                out.extend_from_slice(&(f32::from(clamp12(s.re)) / FLOAT_SCALE).to_le_bytes());
                out.extend_from_slice(&(f32::from(clamp12(s.im)) / FLOAT_SCALE).to_le_bytes());
            }
        }
        SampleFormat::I12In16 => {
            for s in samples {
                out.extend_from_slice(&clamp12(s.re).to_le_bytes());
                out.extend_from_slice(&clamp12(s.im).to_le_bytes());
            }
        }
        SampleFormat::Packed12 => {
            for s in samples {
                let i = clamp12(s.re) as u16 & 0x0FFF;
                let q = clamp12(s.im) as u16 & 0x0FFF;
                out.push(i as u8);
                out.push(((i >> 8) as u8 & 0x0F) | ((q << 4) as u8));
                out.push((q >> 4) as u8);
            }
        }
    }
}

/// Append the samples decoded from `bytes` to `out`.
///
/// `bytes` must hold a whole number of samples.
pub fn decode(format: SampleFormat, bytes: &[u8], out: &mut Vec<Complex<i16>>) -> Result<()> {
    let width = format.bytes_per_sample();
    if bytes.len() % width != 0 {
        return Err(LmsError::invalid_argument(format!(
            "{} bytes is not a whole number of {format:?} samples",
            bytes.len()
        )));
    }
    out.reserve(bytes.len() / width);
    match format {
        SampleFormat::Float32 => {
            for b in bytes.chunks_exact(8) {
                let re = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let im = f32::from_le_bytes([b[4], b[5], b[6], b[7]]);
                out.push(Complex::new(from_float(re), from_float(im)));
            }
        }
        SampleFormat::I12In16 => {
            for b in bytes.chunks_exact(4) {
                let re = u16::from_le_bytes([b[0], b[1]]);
                let im = u16::from_le_bytes([b[2], b[3]]);
                out.push(Complex::new(sign_extend12(re), sign_extend12(im)));
            }
        }
        SampleFormat::Packed12 => {
            for b in bytes.chunks_exact(3) {
                let i = u16::from(b[0]) | (u16::from(b[1] & 0x0F) << 8);
                let q = u16::from(b[1] >> 4) | (u16::from(b[2]) << 4);
                out.push(Complex::new(sign_extend12(i), sign_extend12(q)));
            }
        }
    }
    Ok(())
}

fn from_float(value: f32) -> i16 {
    (value * FLOAT_SCALE)
        .round()
        .clamp(f32::from(I12_MIN), f32::from(I12_MAX)) as i16
}

/// Application-side sample type accepted by `recv`/`send`.
pub trait HostSample: Copy + Default + Send + Sync + 'static {
    /// Whether buffers of this type can serve a stream in `format`.
    fn accepts(format: SampleFormat) -> bool;
    /// Convert from the canonical 12-bit form.
    fn from_canonical(sample: Complex<i16>) -> Self;
    /// Convert to the canonical 12-bit form, clamping out-of-range values.
    fn to_canonical(self) -> Complex<i16>;
}

impl HostSample for Complex<i16> {
    fn accepts(format: SampleFormat) -> bool {
        matches!(format, SampleFormat::I12In16 | SampleFormat::Packed12)
    }

    fn from_canonical(sample: Complex<i16>) -> Self {
        sample
    }

    fn to_canonical(self) -> Complex<i16> {
        Complex::new(clamp12(self.re), clamp12(self.im))
    }
}

impl HostSample for Complex<f32> {
    fn accepts(format: SampleFormat) -> bool {
        format == SampleFormat::Float32
    }

    fn from_canonical(sample: Complex<i16>) -> Self {
        Complex::new(
            f32::from(sample.re) / FLOAT_SCALE,
            f32::from(sample.im) / FLOAT_SCALE,
        )
    }

    fn to_canonical(self) -> Complex<i16> {
        Complex::new(from_float(self.re), from_float(self.im))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_components() -> impl DoubleEndedIterator<Item = i16> {
        I12_MIN..=I12_MAX
    }

    fn round_trip(format: SampleFormat, samples: &[Complex<i16>]) -> Vec<Complex<i16>> {
        let mut bytes = Vec::new();
        encode(format, samples, &mut bytes);
        assert_eq!(bytes.len(), format.encoded_len(samples.len()));
        let mut decoded = Vec::new();
        decode(format, &bytes, &mut decoded).unwrap();
        decoded
    }

    #[test]
    fn test_every_component_value_round_trips() {
        // I sweeps the full range while Q sweeps it in reverse, so both
        // nibble positions of the packed form see every value.
        let samples: Vec<Complex<i16>> = all_components()
            .zip(all_components().rev())
            .map(|(i, q)| Complex::new(i, q))
            .collect();
        for format in [SampleFormat::Float32, SampleFormat::I12In16, SampleFormat::Packed12] {
            assert_eq!(round_trip(format, &samples), samples, "{format:?}");
        }
    }

    #[test]
    fn test_packed_layout() {
        let mut bytes = Vec::new();
        encode(
            SampleFormat::Packed12,
            &[Complex::new(0x123, 0x456), Complex::new(-1, -2048)],
            &mut bytes,
        );
        assert_eq!(bytes, vec![0x23, 0x61, 0x45, 0xFF, 0x0F, 0x80]);
    }

    #[test]
    fn test_packed_saves_a_quarter() {
        let n = 1360;
        assert_eq!(
            SampleFormat::Packed12.encoded_len(n) * 4,
            SampleFormat::I12In16.encoded_len(n) * 3
        );
    }

    #[test]
    fn test_out_of_range_components_clamp() {
        let decoded = round_trip(SampleFormat::I12In16, &[Complex::new(4000, -4000)]);
        assert_eq!(decoded, vec![Complex::new(I12_MAX, I12_MIN)]);
    }

    #[test]
    fn test_partial_sample_rejected() {
        let mut out = Vec::new();
        assert!(decode(SampleFormat::Packed12, &[0, 1, 2, 3], &mut out).is_err());
    }

    #[test]
    fn test_host_sample_conversion() {
        let c = Complex::new(1024i16, -2048);
        let f = <Complex<f32> as HostSample>::from_canonical(c);
        assert_eq!(f, Complex::new(0.5, -1.0));
        assert_eq!(f.to_canonical(), c);
        assert!(<Complex<f32> as HostSample>::accepts(SampleFormat::Float32));
        assert!(!<Complex<i16> as HostSample>::accepts(SampleFormat::Float32));
        assert_eq!(SampleFormat::Float32.link_format(), SampleFormat::I12In16);
    }
}
