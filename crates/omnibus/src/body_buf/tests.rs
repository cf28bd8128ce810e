use crate::error::ErrorKind;
use crate::proto::Endianness;
use crate::{Basic, BodyBuf, Signature};

#[test]
fn array_length_excludes_leading_padding() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::UINT64).unwrap();
    w.write_basic(Basic::U64(1)).unwrap();
    w.write_basic(Basic::U64(2)).unwrap();
    w.close_array().unwrap();
    w.finish().unwrap();

    // Length field, padding to the 8-aligned element start, two elements.
    assert_eq!(buf.len(), 4 + 4 + 16);
    assert_eq!(&buf.get()[..4], &16u32.to_ne_bytes());
}

#[test]
fn array_length_includes_inter_element_padding() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::new(b"(yu)").unwrap()).unwrap();

    for n in 0..2u32 {
        w.open_struct().unwrap();
        w.write_basic(Basic::Byte(n as u8)).unwrap();
        w.write_basic(Basic::U32(n)).unwrap();
        w.close_struct().unwrap();
    }

    w.close_array().unwrap();
    w.finish().unwrap();

    // Each element is 8 bytes (byte, pad(3), u32), no trailing padding.
    assert_eq!(&buf.get()[..4], &16u32.to_ne_bytes());
}

#[test]
fn empty_array_pads_to_element_alignment() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::UINT64).unwrap();
    w.close_array().unwrap();
    w.finish().unwrap();

    // The padding after the length is emitted even without elements, so the
    // element start offset is deterministic.
    assert_eq!(buf.get(), &[0, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(buf.signature(), "at");
}

#[test]
fn array_element_type_is_enforced() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::UINT32).unwrap();
    w.write_basic(Basic::U32(1)).unwrap();

    let err = w.write_basic(Basic::Str("nope")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TypeMismatch { .. }));
}

#[test]
fn variant_content_is_enforced() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_variant(Signature::UINT32).unwrap();

    let err = w.write_basic(Basic::Byte(1)).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TypeMismatch { .. }));

    w.write_basic(Basic::U32(1)).unwrap();
    w.close_variant().unwrap();
    w.finish().unwrap();
}

#[test]
fn incomplete_variant_fails_to_close() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_variant(Signature::new(b"(uu)").unwrap()).unwrap();
    w.open_struct().unwrap();
    w.write_basic(Basic::U32(1)).unwrap();

    // Closing the variant while the struct is open closes the wrong scope.
    let err = w.close_variant().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::MismatchedContainer));
}

#[test]
fn signature_appends_only_outside_expectations() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::new(b"as").unwrap()).unwrap();
    w.open_array(Signature::STRING).unwrap();
    w.write_basic(Basic::Str("a")).unwrap();
    w.write_basic(Basic::Str("b")).unwrap();
    w.close_array().unwrap();
    w.open_array(Signature::STRING).unwrap();
    w.close_array().unwrap();
    w.close_array().unwrap();
    w.finish().unwrap();

    // The element signature appears once regardless of element count.
    assert_eq!(buf.signature(), "aas");
}

#[test]
fn write_reader_splices_structure() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.write_basic(Basic::U32(99)).unwrap();
    w.open_array(Signature::new(b"(yv)").unwrap()).unwrap();

    for n in 1..3u8 {
        w.open_struct().unwrap();
        w.write_basic(Basic::Byte(n)).unwrap();
        w.open_variant(Signature::STRING).unwrap();
        w.write_basic(Basic::Str("x")).unwrap();
        w.close_variant().unwrap();
        w.close_struct().unwrap();
    }

    w.close_array().unwrap();
    w.finish().unwrap();

    let mut copy = BodyBuf::new();
    let body = buf.as_body();
    let mut reader = body.reader();

    let mut w = copy.writer();
    w.write_reader(&mut reader).unwrap();
    w.finish().unwrap();

    assert_eq!(copy.signature(), buf.signature());
    assert_eq!(copy.get(), buf.get());
}

#[test]
fn write_reader_rolls_back_on_error() {
    let mut source = BodyBuf::new();
    source.store(7u32).unwrap();

    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.write_basic(Basic::Byte(1)).unwrap();

    // Splicing a u32 into a variant expecting a string fails and must leave
    // the buffers exactly as they were before the call.
    w.open_variant(Signature::STRING).unwrap();

    let data_len = buf_len(&w);
    let body = source.as_body();
    let mut reader = body.reader();
    assert!(w.write_reader(&mut reader).is_err());
    assert_eq!(buf_len(&w), data_len);

    w.write_basic(Basic::Str("ok")).unwrap();
    w.close_variant().unwrap();
    w.finish().unwrap();

    assert_eq!(buf.signature(), "yv");
}

fn buf_len(w: &crate::Writer<'_>) -> usize {
    w.body_len()
}

#[test]
fn foreign_endianness_is_adjusted_on_read() {
    let mut buf = BodyBuf::with_endianness(Endianness::BIG);
    buf.sig_mut().push(b'u').unwrap();
    buf.data_mut().extend_from_slice(&1u32.to_be_bytes());

    let body = buf.as_body();
    let reader = body.reader();
    assert_eq!(reader.read_basic().unwrap(), Basic::U32(1));
}
