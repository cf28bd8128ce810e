use crate::error::ErrorKind;
use crate::{Basic, BodyBuf, Reader, Signature, Type};

use super::validate_body;

#[test]
fn read_basics() {
    let mut buf = BodyBuf::new();
    buf.store(1u8).unwrap();
    buf.store(true).unwrap();
    buf.store(-2i16).unwrap();
    buf.store(3u32).unwrap();
    buf.store(4.5f64).unwrap();
    buf.store("five").unwrap();

    let body = buf.as_body();
    let mut r = body.reader();

    assert_eq!(r.read_basic().unwrap(), Basic::Byte(1));
    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::Bool(true));
    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::I16(-2));
    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::U32(3));
    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::Double(4.5));
    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::Str("five"));
    assert!(!r.next().unwrap());
    assert_eq!(r.current_type(), Type::INVALID);
}

#[test]
fn read_struct() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_struct().unwrap();
    w.write_basic(Basic::U32(10)).unwrap();
    w.write_basic(Basic::Str("ten")).unwrap();
    w.close_struct().unwrap();
    w.write_basic(Basic::Byte(7)).unwrap();
    w.finish().unwrap();

    assert_eq!(buf.signature(), "(us)y");

    let body = buf.as_body();
    let mut r = body.reader();

    assert_eq!(r.current_type(), Type::OPEN_PAREN);

    let mut sub = r.recurse().unwrap();
    assert_eq!(sub.read_basic().unwrap(), Basic::U32(10));
    assert!(sub.next().unwrap());
    assert_eq!(sub.read_basic().unwrap(), Basic::Str("ten"));
    assert!(!sub.next().unwrap());
    assert_eq!(sub.current_type(), Type::INVALID);

    // The parent cursor is unaffected by the child and skips the whole
    // struct on next.
    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::Byte(7));
    assert!(!r.next().unwrap());
}

#[test]
fn read_array() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::UINT32).unwrap();
    w.write_basic(Basic::U32(1)).unwrap();
    w.write_basic(Basic::U32(2)).unwrap();
    w.write_basic(Basic::U32(3)).unwrap();
    w.close_array().unwrap();
    w.finish().unwrap();

    let body = buf.as_body();
    let r = body.reader();

    let mut sub = r.recurse().unwrap();
    assert_eq!(sub.read_basic().unwrap(), Basic::U32(1));
    assert!(sub.next().unwrap());
    assert_eq!(sub.read_basic().unwrap(), Basic::U32(2));
    assert!(sub.next().unwrap());
    assert_eq!(sub.read_basic().unwrap(), Basic::U32(3));
    assert!(!sub.next().unwrap());
    assert_eq!(sub.current_type(), Type::INVALID);
}

#[test]
fn empty_array_recurse_fails_but_skips() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::new(b"(uu)").unwrap()).unwrap();
    w.close_array().unwrap();
    w.write_basic(Basic::Byte(9)).unwrap();
    w.finish().unwrap();

    assert_eq!(buf.signature(), "a(uu)y");

    let body = buf.as_body();
    let mut r = body.reader();

    let err = r.recurse().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::EmptyArray));

    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::Byte(9));
}

#[test]
fn read_variant() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_variant(Signature::INT32).unwrap();
    w.write_basic(Basic::I32(42)).unwrap();
    w.close_variant().unwrap();
    w.write_basic(Basic::Str("tail")).unwrap();
    w.finish().unwrap();

    assert_eq!(buf.signature(), "vs");

    let body = buf.as_body();
    let mut r = body.reader();

    let sub = r.recurse().unwrap();
    assert_eq!(sub.read_basic().unwrap(), Basic::I32(42));

    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::Str("tail"));
    assert!(!r.next().unwrap());
}

#[test]
fn marks_restore_cursor() {
    let mut buf = BodyBuf::new();
    buf.store(1u32).unwrap();
    buf.store(2u32).unwrap();

    let body = buf.as_body();
    let mut r = body.reader();

    let mark = r.mark();
    assert!(r.next().unwrap());
    assert_eq!(r.read_basic().unwrap(), Basic::U32(2));

    r.restore(mark);
    assert_eq!(r.read_basic().unwrap(), Basic::U32(1));
}

#[test]
fn types_only_walk() {
    let sig = Signature::new(b"ia(yv)s").unwrap();
    let mut r = Reader::types_only(sig);

    assert_eq!(r.current_type(), Type::INT32);
    assert!(r.read_basic().is_err());
    assert!(r.next().unwrap());
    assert_eq!(r.current_type(), Type::ARRAY);

    let sub = r.recurse().unwrap();
    assert_eq!(sub.current_type(), Type::OPEN_PAREN);

    let mut inner = sub.recurse().unwrap();
    assert_eq!(inner.current_type(), Type::BYTE);
    assert!(inner.next().unwrap());
    assert_eq!(inner.current_type(), Type::VARIANT);
    assert!(!inner.next().unwrap());

    assert!(r.next().unwrap());
    assert_eq!(r.current_type(), Type::STRING);
    assert!(!r.next().unwrap());
}

#[test]
fn validate_accepts_written_bodies() {
    let mut buf = BodyBuf::new();

    let mut w = buf.writer();
    w.open_array(Signature::new(b"(yv)").unwrap()).unwrap();
    w.open_struct().unwrap();
    w.write_basic(Basic::Byte(1)).unwrap();
    w.open_variant(Signature::INT32).unwrap();
    w.write_basic(Basic::I32(42)).unwrap();
    w.close_variant().unwrap();
    w.close_struct().unwrap();
    w.close_array().unwrap();
    w.finish().unwrap();

    validate_body(&buf.as_body()).unwrap();
}

#[test]
fn validate_rejects_trailing_bytes() {
    let mut buf = BodyBuf::new();
    buf.store(1u32).unwrap();
    buf.store_frame(2u32);

    assert!(validate_body(&buf.as_body()).is_err());
}

#[test]
fn validate_rejects_truncated_string() {
    let mut buf = BodyBuf::new();
    // Length claims four bytes but only three follow.
    buf.sig_mut().push(b's').unwrap();
    buf.store_frame(4u32);
    buf.data_mut().extend_from_slice(b"abc");

    assert!(validate_body(&buf.as_body()).is_err());
}
