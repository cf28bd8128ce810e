use super::{MAX_CONTAINER_DEPTH, Signature, SignatureBuf, SignatureBuilder};

#[test]
fn validate_basic() {
    assert!(Signature::new(b"").is_ok());
    assert!(Signature::new(b"y").is_ok());
    assert!(Signature::new(b"ybnqiuxtdsogv").is_ok());
    assert!(Signature::new(b"ai").is_ok());
    assert!(Signature::new(b"a(yv)").is_ok());
    assert!(Signature::new(b"aa{sv}").is_ok());
    assert!(Signature::new(b"(i(i(i)))").is_ok());

    assert!(Signature::new(b"a").is_err());
    assert!(Signature::new(b"()").is_err());
    assert!(Signature::new(b"(i").is_err());
    assert!(Signature::new(b"i)").is_err());
    assert!(Signature::new(b"a{vs}").is_err());
    assert!(Signature::new(b"a{s}").is_err());
    assert!(Signature::new(b"a{ssi}").is_err());
    assert!(Signature::new(b"{ss}").is_err());
    assert!(Signature::new(b"m").is_err());
}

#[test]
fn validate_depth() {
    let mut deep_array = Vec::new();
    deep_array.resize(MAX_CONTAINER_DEPTH, b'a');
    deep_array.push(b'i');
    assert!(Signature::new(&deep_array).is_ok());

    let mut too_deep = vec![b'a'];
    too_deep.extend_from_slice(&deep_array);
    assert!(Signature::new(&too_deep).is_err());

    let mut deep_struct = Vec::new();

    for _ in 0..MAX_CONTAINER_DEPTH + 1 {
        deep_struct.push(b'(');
    }

    deep_struct.push(b'i');

    for _ in 0..MAX_CONTAINER_DEPTH + 1 {
        deep_struct.push(b')');
    }

    assert!(Signature::new(&deep_struct).is_err());
}

#[test]
fn complete_types() {
    let sig = Signature::new(b"ia(yv)sa{sv}").unwrap();
    let types = sig.iter().map(|s| s.as_str()).collect::<Vec<_>>();
    assert_eq!(types, vec!["i", "a(yv)", "s", "a{sv}"]);

    let (head, tail) = sig.split_first().unwrap();
    assert_eq!(head, "i");
    assert_eq!(tail, "a(yv)sa{sv}");

    assert_eq!(sig.complete_at(1).unwrap(), "a(yv)");
    assert_eq!(sig.complete_at(3).unwrap(), "y");
    assert!(sig.complete_at(5).is_none());
    assert!(sig.complete_at(sig.len()).is_none());

    assert!(Signature::new(b"i").unwrap().is_single_complete_type());
    assert!(Signature::new(b"aai").unwrap().is_single_complete_type());
    assert!(!Signature::new(b"ii").unwrap().is_single_complete_type());
    assert!(!Signature::EMPTY.is_single_complete_type());
}

#[test]
fn owned_signature() {
    let sig = SignatureBuf::new(b"a(yv)").unwrap();
    assert_eq!(&*sig, Signature::new_const(b"a(yv)"));
    assert_eq!(sig, *Signature::new_const(b"a(yv)"));

    let owned = Signature::new_const(b"ii").to_owned();
    assert_eq!(owned.as_bytes(), b"ii");
}

#[test]
fn builder() {
    let mut builder = SignatureBuilder::new();
    builder.push(b'i').unwrap();
    builder.open_array().unwrap();
    builder.open_struct().unwrap();
    builder.push(b'y').unwrap();
    builder.push(b'v').unwrap();
    builder.close_struct().unwrap();
    builder.close_array();
    assert_eq!(builder.to_signature(), "ia(yv)");

    let mark = builder.len();
    builder.push(b's').unwrap();
    builder.truncate(mark);
    assert_eq!(builder.to_signature(), "ia(yv)");
}
