//! Property tests for the sample codecs and packet framing.

use lms_driver::stream::codec::{self, clamp12};
use lms_driver::stream::packet::{decode_packet, encode_packet, samples_per_packet, PacketFlags, PacketHeader};
use lms_driver::SampleFormat;
use num_complex::Complex;
use proptest::prelude::*;

fn sample() -> impl Strategy<Value = Complex<i16>> {
    (-2048i16..=2047, -2048i16..=2047).prop_map(|(re, im)| Complex::new(re, im))
}

fn format() -> impl Strategy<Value = SampleFormat> {
    prop_oneof![
        Just(SampleFormat::I12In16),
        Just(SampleFormat::Packed12),
        Just(SampleFormat::Float32),
    ]
}

proptest! {
    #[test]
    fn twelve_bit_samples_are_lossless(format in format(), samples in prop::collection::vec(sample(), 0..300)) {
        let mut bytes = Vec::new();
        codec::encode(format, &samples, &mut bytes);
        prop_assert_eq!(bytes.len(), format.encoded_len(samples.len()));

        let mut decoded = Vec::new();
        codec::decode(format, &bytes, &mut decoded).unwrap();
        prop_assert_eq!(decoded, samples);
    }

    #[test]
    fn out_of_range_components_saturate(format in format(), re in any::<i16>(), im in any::<i16>()) {
        let mut bytes = Vec::new();
        codec::encode(format, &[Complex::new(re, im)], &mut bytes);
        let mut decoded = Vec::new();
        codec::decode(format, &bytes, &mut decoded).unwrap();
        prop_assert_eq!(decoded, vec![Complex::new(clamp12(re), clamp12(im))]);
    }

    #[test]
    fn packets_keep_channels_apart(
        packed in any::<bool>(),
        two_channels in any::<bool>(),
        counter in any::<u64>(),
        seed in prop::collection::vec(sample(), 1..64),
    ) {
        let link = if packed { SampleFormat::Packed12 } else { SampleFormat::I12In16 };
        let channels = if two_channels { 2 } else { 1 };
        let per_channel = samples_per_packet(link, channels);
        let data: Vec<Vec<Complex<i16>>> = (0..channels)
            .map(|c| seed.iter().cycle().skip(c).take(per_channel).copied().collect())
            .collect();
        let slices: Vec<&[Complex<i16>]> = data.iter().map(Vec::as_slice).collect();
        let header = PacketHeader { flags: PacketFlags::END_OF_BURST, counter };

        let mut packet = Vec::new();
        encode_packet(header, link, &slices, &mut packet).unwrap();
        let (parsed, split) = decode_packet(&packet, link, channels).unwrap();
        prop_assert_eq!(parsed, header);
        prop_assert_eq!(split, data);
    }
}
