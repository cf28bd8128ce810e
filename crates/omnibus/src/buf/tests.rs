use super::{AlignedBuf, UnalignedBuf, padding_to, padding_to_align};

#[test]
fn padding() {
    assert_eq!(padding_to::<u8>(3), 0);
    assert_eq!(padding_to::<u16>(3), 1);
    assert_eq!(padding_to::<u32>(3), 1);
    assert_eq!(padding_to::<u32>(4), 0);
    assert_eq!(padding_to::<u64>(1), 7);
    assert_eq!(padding_to_align(8, 8), 0);
    assert_eq!(padding_to_align(8, 9), 7);
}

#[test]
fn aligned_store_load() {
    let mut buf = AlignedBuf::new();
    buf.store(1u8);
    buf.store(2u32);
    buf.store(3u64);

    assert_eq!(buf.len(), 16);

    let mut read = buf.as_aligned();
    assert_eq!(read.load::<u8>().unwrap(), 1);
    assert_eq!(read.load::<u32>().unwrap(), 2);
    assert_eq!(read.load::<u64>().unwrap(), 3);
    assert!(read.is_empty());
}

#[test]
fn aligned_padding_is_zeroed() {
    let mut buf = AlignedBuf::new();
    buf.store(0xffu8);
    buf.store(0xffff_ffffu32);

    assert_eq!(buf.get(), &[0xff, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
}

#[test]
fn aligned_alloc_store_at() {
    let mut buf = AlignedBuf::new();
    let at = buf.alloc::<u32>();
    buf.store(7u8);
    buf.store_at(at, 42);

    let mut read = buf.as_aligned();
    assert_eq!(read.load::<u32>().unwrap(), 42);
    assert_eq!(read.load::<u8>().unwrap(), 7);
}

#[test]
fn aligned_consume_front() {
    let mut buf = AlignedBuf::new();
    buf.store(1u64);
    buf.store(2u64);
    buf.store(3u64);

    buf.consume_front(8);
    assert_eq!(buf.len(), 16);

    let mut read = buf.as_aligned();
    assert_eq!(read.load::<u64>().unwrap(), 2);
    assert_eq!(read.load::<u64>().unwrap(), 3);
}

#[test]
fn aligned_load_slice_nul() {
    let mut buf = AlignedBuf::new();
    buf.extend_from_slice_nul(b"foo");

    let mut read = buf.as_aligned();
    assert_eq!(read.load_slice_nul(3).unwrap(), b"foo");
    assert!(read.is_empty());

    let mut read = buf.as_aligned();
    assert!(read.load_slice_nul(2).is_err());
}

#[test]
fn unaligned_rebased_alignment() {
    let mut buf = UnalignedBuf::new();
    buf.extend_from_slice(b"xyz");
    buf.update_base_align();
    buf.store(1u8);
    buf.store(2u32);

    // Padding is relative to the base, not the buffer start.
    assert_eq!(buf.get(), &[b'x', b'y', b'z', 1, 0, 0, 0, 2, 0, 0, 0]);

    buf.advance(3);
    assert_eq!(buf.len(), 8);
}
