use std::num::NonZeroU32;

use crate::{BodyBuf, Message, MessageKind, ObjectPath};

const PATH: &ObjectPath = ObjectPath::new_const(b"/org/example/Broker");

fn serial(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap()
}

#[test]
fn reply_swaps_endpoints() {
    let m = Message::method_call(PATH, "Frobnicate", serial(1))
        .with_sender(":1.7")
        .with_destination("org.example.Service");

    let reply = m.method_return(serial(2));
    assert_eq!(reply.destination(), m.sender());
    assert_eq!(reply.sender(), m.destination());

    let MessageKind::MethodReturn { reply_serial } = reply.kind() else {
        panic!("expected method return");
    };

    assert_eq!(reply_serial, m.serial());

    let err = m.error("org.example.Error.Failed", serial(3));
    let MessageKind::Error { reply_serial, .. } = err.kind() else {
        panic!("expected error");
    };

    assert_eq!(reply_serial, m.serial());
}

#[test]
fn owned_roundtrip() {
    let mut body = BodyBuf::new();
    body.store(42u32).unwrap();
    body.store("x").unwrap();

    let m = Message::signal(PATH, "Changed", serial(9))
        .with_interface("org.example.Iface")
        .with_body(body.as_body());

    let owned = m.to_owned();
    assert_eq!(owned.borrow(), m);
    assert_eq!(owned.signature(), "us");

    let mut read = owned.body();
    assert_eq!(read.load::<u32>().unwrap(), 42);
    assert_eq!(read.read::<str>().unwrap(), "x");
}
