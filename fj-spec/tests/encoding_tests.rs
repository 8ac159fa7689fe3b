//! Container-format tests against the byte-exact layout.

use fj_spec::image::{pack_words, unpack_words};
use fj_spec::{Image, ImageError, FLAG_COMPRESSED, MAGIC, VERSION};

fn two_op_image(width: u32, compressed: bool) -> Image {
    let mut image = Image::new(width, compressed).unwrap();
    let words = vec![0, 2 * width as u64, 0, 0];
    image
        .add_segment(0, words.len() as u64 * width as u64, pack_words(&words, width))
        .unwrap();
    image
}

#[test]
fn header_layout_is_byte_exact() {
    let image = two_op_image(64, false);
    let bytes = image.to_bytes().unwrap();

    assert_eq!(&bytes[0..4], &MAGIC);
    assert_eq!(u16::from_le_bytes(bytes[4..6].try_into().unwrap()), VERSION);
    assert_eq!(u32::from_le_bytes(bytes[6..10].try_into().unwrap()), 64);
    assert_eq!(u16::from_le_bytes(bytes[10..12].try_into().unwrap()), 0);
    assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 1);
    assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 0);

    // First table entry: starts at bit 0, covers 4 words.
    assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 0);
    assert_eq!(u64::from_le_bytes(bytes[32..40].try_into().unwrap()), 256);
}

#[test]
fn compression_flag_is_bit_zero() {
    let image = two_op_image(64, true);
    let bytes = image.to_bytes().unwrap();
    let flags = u16::from_le_bytes(bytes[10..12].try_into().unwrap());
    assert_eq!(flags & FLAG_COMPRESSED, FLAG_COMPRESSED);
}

#[test]
fn compressed_and_raw_decode_to_the_same_segments() {
    let raw = two_op_image(64, false);
    let compressed = two_op_image(64, true);

    let from_raw = Image::from_bytes(&raw.to_bytes().unwrap()).unwrap();
    let from_compressed = Image::from_bytes(&compressed.to_bytes().unwrap()).unwrap();

    assert_eq!(from_raw.segments, from_compressed.segments);
}

#[test]
fn trailer_crc_covers_the_whole_file() {
    let bytes = two_op_image(16, false).to_bytes().unwrap();
    // Flip one bit anywhere (header, table or data): the load must fail.
    for position in [1usize, 13, 27, bytes.len() - 6] {
        let mut copy = bytes.clone();
        copy[position] ^= 1;
        assert!(
            Image::from_bytes(&copy).is_err(),
            "corruption at byte {} went unnoticed",
            position
        );
    }
}

#[test]
fn width_is_checked_against_the_consumer() {
    let image = two_op_image(32, false);
    let loaded = Image::from_bytes(&image.to_bytes().unwrap()).unwrap();
    assert_eq!(loaded.width, 32);

    // The consumer-side check lives in the runtime; here the container
    // just reports what it holds.
    let err = ImageError::WidthMismatch {
        expected: 64,
        found: loaded.width,
    };
    assert!(err.to_string().contains("expected 64"));
}

#[test]
fn words_round_trip_through_bit_packing() {
    for width in [8u32, 16, 32, 64] {
        let mask = fj_spec::address_mask(width);
        let words: Vec<u64> = [0u64, 1, 0xA5, 0xFFFF_FFFF_FFFF_FFFF, 1 << (width - 1)]
            .iter()
            .map(|w| w & mask)
            .collect();
        let packed = pack_words(&words, width);
        assert_eq!(packed.len(), words.len() * width as usize / 8);
        assert_eq!(unpack_words(&packed, width), words);
    }
}
