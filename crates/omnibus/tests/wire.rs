use std::num::NonZeroU32;

use omnibus::{
    Basic, Body, BodyBuf, Message, MessageKind, ObjectPath, RecvBuf, SendBuf, Signature, Type,
};

const PATH: &ObjectPath = ObjectPath::new_const(b"/com/example/Object");

fn serial(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap()
}

/// Write the sample `a(yv)` content `[(1, variant<i32 42>), (2, variant<str
/// "x">)]` into the buffer.
fn write_sample(buf: &mut BodyBuf) {
    let mut w = buf.writer();
    w.open_array(Signature::new(b"(yv)").unwrap()).unwrap();

    w.open_struct().unwrap();
    w.write_basic(Basic::Byte(1)).unwrap();
    w.open_variant(Signature::INT32).unwrap();
    w.write_basic(Basic::I32(42)).unwrap();
    w.close_variant().unwrap();
    w.close_struct().unwrap();

    w.open_struct().unwrap();
    w.write_basic(Basic::Byte(2)).unwrap();
    w.open_variant(Signature::STRING).unwrap();
    w.write_basic(Basic::Str("x")).unwrap();
    w.close_variant().unwrap();
    w.close_struct().unwrap();

    w.close_array().unwrap();
    w.finish().unwrap();
}

/// Read the sample back, asserting every value.
fn check_sample(body: &Body<'_>, leading: usize) {
    let mut reader = body.reader();

    for _ in 0..leading {
        assert_eq!(reader.current_type(), Type::BYTE);
        assert!(reader.next().unwrap());
    }

    assert_eq!(reader.current_type(), Type::ARRAY);

    let mut elements = reader.recurse().unwrap();

    let mut entry = elements.recurse().unwrap();
    assert_eq!(entry.read_basic().unwrap(), Basic::Byte(1));
    assert!(entry.next().unwrap());
    let variant = entry.recurse().unwrap();
    assert_eq!(variant.read_basic().unwrap(), Basic::I32(42));
    assert!(!entry.next().unwrap());

    assert!(elements.next().unwrap());

    let mut entry = elements.recurse().unwrap();
    assert_eq!(entry.read_basic().unwrap(), Basic::Byte(2));
    assert!(entry.next().unwrap());
    let variant = entry.recurse().unwrap();
    assert_eq!(variant.read_basic().unwrap(), Basic::Str("x"));
    assert!(!entry.next().unwrap());

    assert!(!elements.next().unwrap());
}

#[test]
fn sample_roundtrip_at_every_offset() {
    // Shift the array start through every alignment phase with leading
    // bytes; the values must survive bit for bit.
    for leading in 0..8usize {
        let mut buf = BodyBuf::new();

        for n in 0..leading {
            buf.store(n as u8).unwrap();
        }

        write_sample(&mut buf);
        check_sample(&buf.as_body(), leading);
    }
}

#[test]
fn sample_survives_message_framing() -> anyhow::Result<()> {
    let mut body = BodyBuf::new();
    write_sample(&mut body);

    let mut send = SendBuf::new();

    let message = Message::method_call(PATH, "Deliver", serial(1))
        .with_interface("com.example.Iface")
        .with_destination("com.example.Peer")
        .with_sender(":1.1")
        .with_body(body.as_body());

    send.write_message(&message)?;

    let mut recv = RecvBuf::new();
    recv.feed(send.get());

    let parsed = recv.try_parse()?.expect("one complete message");

    assert_eq!(parsed.borrow(), message);
    assert_eq!(parsed.signature(), "a(yv)");
    assert_eq!(parsed.body().get(), body.get());
    check_sample(&parsed.body(), 0);
    Ok(())
}

#[test]
fn framing_across_partial_feeds() -> anyhow::Result<()> {
    let mut body = BodyBuf::new();
    body.store(7u32)?;
    body.store("chunked")?;

    let mut send = SendBuf::new();

    let message = Message::signal(PATH, "Chunk", serial(3))
        .with_interface("com.example.Iface")
        .with_body(body.as_body());

    send.write_message(&message)?;

    let bytes = send.get();
    let mut recv = RecvBuf::new();

    for chunk in bytes.chunks(3) {
        recv.feed(chunk);
    }

    let parsed = recv.try_parse()?.expect("one complete message");
    assert_eq!(parsed.borrow(), message);

    // Nothing left over.
    assert!(recv.try_parse()?.is_none());
    assert!(recv.is_empty());
    Ok(())
}

#[test]
fn pipelined_messages_parse_in_order() {
    let mut send = SendBuf::new();

    for n in 1..4u32 {
        let mut body = BodyBuf::new();
        body.store(n).unwrap();

        let message = Message::signal(PATH, "Tick", serial(n))
            .with_interface("com.example.Iface")
            .with_body(body.as_body());

        send.write_message(&message).unwrap();
    }

    let mut recv = RecvBuf::new();
    recv.feed(send.get());

    for n in 1..4u32 {
        let parsed = recv.try_parse().unwrap().expect("message");
        assert_eq!(parsed.serial().get(), n);
        assert_eq!(parsed.body().load::<u32>().unwrap(), n);
    }

    assert!(recv.try_parse().unwrap().is_none());
}

#[test]
fn incomplete_message_waits_for_more() {
    let mut body = BodyBuf::new();
    body.store("partial").unwrap();

    let mut send = SendBuf::new();

    let message = Message::signal(PATH, "Part", serial(9))
        .with_interface("com.example.Iface")
        .with_body(body.as_body());

    send.write_message(&message).unwrap();

    let bytes = send.get();
    let (head, tail) = bytes.split_at(bytes.len() - 5);

    let mut recv = RecvBuf::new();
    recv.feed(head);
    assert!(recv.try_parse().unwrap().is_none());

    recv.feed(tail);
    assert!(recv.try_parse().unwrap().is_some());
}

#[test]
fn big_endian_input_is_accepted() {
    // A hand-marshalled big-endian method return: serial 5, replying to
    // serial 9, with a single u32 argument of 7.
    let mut bytes = Vec::new();

    bytes.extend_from_slice(&[b'B', 2, 0, 1]);
    bytes.extend_from_slice(&4u32.to_be_bytes());
    bytes.extend_from_slice(&5u32.to_be_bytes());
    bytes.extend_from_slice(&27u32.to_be_bytes());

    // Field REPLY_SERIAL: code, signature "u", pad to the variant value.
    bytes.extend_from_slice(&[5, 1, b'u', 0, 0, 0, 0, 0]);
    bytes.extend_from_slice(&9u32.to_be_bytes());

    // Field SIGNATURE, 8-aligned within the fields array.
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes.extend_from_slice(&[8, 1, b'g', 0, 0, 0, 0, 0]);
    bytes.extend_from_slice(&[1, b'u', 0]);

    // Pad the header out to 8, then the body.
    bytes.extend_from_slice(&[0, 0, 0, 0, 0]);
    bytes.extend_from_slice(&7u32.to_be_bytes());

    let mut recv = RecvBuf::new();
    recv.feed(&bytes);

    let parsed = recv.try_parse().unwrap().expect("one complete message");

    assert_eq!(parsed.serial(), serial(5));

    let MessageKind::MethodReturn { reply_serial } = parsed.kind() else {
        panic!("expected a method return");
    };

    assert_eq!(reply_serial, serial(9));
    assert_eq!(parsed.signature(), "u");
    assert_eq!(parsed.body().load::<u32>().unwrap(), 7);
}

#[test]
fn malformed_bodies_are_rejected() {
    // A signature declaring a string whose length runs past the body.
    let mut body = BodyBuf::new();
    body.store("x").unwrap();

    let mut send = SendBuf::new();

    let message = Message::signal(PATH, "Bad", serial(2))
        .with_interface("com.example.Iface")
        .with_body(body.as_body());

    send.write_message(&message).unwrap();

    let mut bytes = send.get().to_vec();

    // Corrupt the string length field at the start of the body; the message
    // must now fail validation instead of parsing.
    let body_offset = bytes.len() - body.len();
    bytes[body_offset..body_offset + 4].copy_from_slice(&100u32.to_ne_bytes());

    let mut recv = RecvBuf::new();
    recv.feed(&bytes);
    assert!(recv.try_parse().is_err());
}
