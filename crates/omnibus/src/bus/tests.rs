use std::io::{Read as _, Write as _};
use std::num::NonZeroU32;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::proto::MessageType;
use crate::{BodyBuf, Message, MessageBuf, MessageKind, ObjectPath, RecvBuf, SendBuf};

use super::driver::{DRIVER_INTERFACE, DRIVER_NAME, NameFlag, NameReply, err};
use super::{Broker, BusConfig, Limits};

const DRIVER_PATH: &ObjectPath = ObjectPath::new_const(b"/org/freedesktop/DBus");
const TEST_PATH: &ObjectPath = ObjectPath::new_const(b"/com/example/Object");

fn broker() -> Broker {
    let config = BusConfig {
        limits: Limits {
            oom_backoff: Duration::from_millis(1),
            ..Limits::default()
        },
        ..BusConfig::default()
    };

    Broker::new(config).unwrap()
}

/// A minimal client speaking the wire protocol over one half of a
/// socketpair, with the broker pumped manually in between.
struct TestClient {
    stream: UnixStream,
    recv: RecvBuf,
    send: SendBuf,
    /// Messages set aside while waiting for a specific reply.
    pending: std::collections::VecDeque<MessageBuf>,
    unique: Option<String>,
}

impl TestClient {
    fn connect(broker: &mut Broker) -> TestClient {
        let (ours, theirs) = UnixStream::pair().unwrap();
        broker.add_peer(theirs).unwrap();
        ours.set_nonblocking(true).unwrap();

        let mut client = TestClient {
            stream: ours,
            recv: RecvBuf::new(),
            send: SendBuf::new(),
            pending: std::collections::VecDeque::new(),
            unique: None,
        };

        client.write_all(broker, b"\0AUTH EXTERNAL\r\nBEGIN\r\n");
        client.read_auth_line(broker);
        client
    }

    /// Connect and complete Hello.
    fn register(broker: &mut Broker) -> TestClient {
        let mut client = TestClient::connect(broker);

        let serial = client.call_driver(broker, "Hello", BodyBuf::new());
        let reply = client.wait_reply(broker, serial);

        let MessageKind::MethodReturn { .. } = reply.kind() else {
            panic!("Hello failed: {reply:?}");
        };

        let unique = reply.body().read::<str>().unwrap().to_owned();
        client.unique = Some(unique);

        // The NameAcquired signal for the unique name arrives alongside.
        let signal = client.wait_message(broker);
        assert_signal(&signal, "NameAcquired");

        client
    }

    fn unique(&self) -> &str {
        self.unique.as_deref().unwrap()
    }

    fn write_all(&mut self, broker: &mut Broker, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(n) => bytes = &bytes[n..],
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    broker.turn(false).unwrap();
                }
                Err(error) => panic!("write failed: {error}"),
            }
        }

        broker.turn(false).unwrap();
    }

    /// Read and discard the `OK <guid>` line of the auth exchange.
    fn read_auth_line(&mut self, broker: &mut Broker) {
        let mut line = Vec::new();

        for _ in 0..1000 {
            broker.turn(false).unwrap();

            let mut byte = [0u8; 1];

            match self.stream.read(&mut byte) {
                Ok(1) => {
                    line.push(byte[0]);

                    if line.ends_with(b"\r\n") {
                        assert!(line.starts_with(b"OK "), "unexpected auth reply: {line:?}");
                        return;
                    }
                }
                Ok(_) => panic!("auth stream closed"),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) => panic!("auth read failed: {error}"),
            }
        }

        panic!("no auth reply");
    }

    /// Send a method call to the bus driver, returning its serial.
    fn call_driver(&mut self, broker: &mut Broker, member: &str, body: BodyBuf) -> NonZeroU32 {
        let serial = self.send.next_serial();

        let message = Message::method_call(DRIVER_PATH, member, serial)
            .with_interface(DRIVER_INTERFACE)
            .with_destination(DRIVER_NAME)
            .with_body(body.as_body());

        self.send_message(broker, &message);
        serial
    }

    fn send_message(&mut self, broker: &mut Broker, message: &Message<'_>) {
        self.send.write_message(message).unwrap();

        while !self.send.is_empty() {
            match self.stream.write(self.send.get()) {
                Ok(n) => self.send.advance(n),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) => panic!("write failed: {error}"),
            }

            broker.turn(false).unwrap();
        }

        broker.turn(false).unwrap();
    }

    /// Try to read one message without waiting for more to arrive.
    fn try_message(&mut self, broker: &mut Broker) -> Option<MessageBuf> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }

        for _ in 0..16 {
            if let Some(message) = self.recv.try_parse().unwrap() {
                return Some(message);
            }

            broker.turn(false).unwrap();

            let mut chunk = [0u8; 1024];

            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.recv.feed(&chunk[..n]),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(error) => panic!("read failed: {error}"),
            }
        }

        self.recv.try_parse().unwrap()
    }

    /// Read one message, pumping until it arrives.
    fn wait_message(&mut self, broker: &mut Broker) -> MessageBuf {
        for _ in 0..1000 {
            if let Some(message) = self.try_message(broker) {
                return message;
            }
        }

        panic!("no message arrived");
    }

    /// Read messages until the reply to `serial` arrives, setting anything
    /// else aside for later reads.
    fn wait_reply(&mut self, broker: &mut Broker, serial: NonZeroU32) -> MessageBuf {
        for _ in 0..1000 {
            let message = self.wait_message(broker);

            match message.kind() {
                MessageKind::MethodReturn { reply_serial } if reply_serial == serial => {
                    return message;
                }
                MessageKind::Error { reply_serial, .. } if reply_serial == serial => {
                    return message;
                }
                _ => self.pending.push_back(message),
            }
        }

        panic!("no reply arrived");
    }

    /// Assert that no message is waiting for this client.
    fn assert_silent(&mut self, broker: &mut Broker) {
        if let Some(message) = self.try_message(broker) {
            panic!("unexpected message: {message:?}");
        }
    }
}

fn assert_signal(message: &MessageBuf, member: &str) {
    match message.kind() {
        MessageKind::Signal {
            member: actual, ..
        } => assert_eq!(actual, member),
        kind => panic!("expected {member} signal, got {kind:?}"),
    }
}

fn request_name(
    client: &mut TestClient,
    broker: &mut Broker,
    name: &str,
    flags: NameFlag,
) -> u32 {
    let mut body = BodyBuf::new();
    body.store(name).unwrap();
    body.store(flags.get()).unwrap();

    let serial = client.call_driver(broker, "RequestName", body);
    let reply = client.wait_reply(broker, serial);

    let MessageKind::MethodReturn { .. } = reply.kind() else {
        panic!("RequestName failed: {reply:?}");
    };

    reply.body().load::<u32>().unwrap()
}

fn add_match(client: &mut TestClient, broker: &mut Broker, rule: &str) {
    let mut body = BodyBuf::new();
    body.store(rule).unwrap();

    let serial = client.call_driver(broker, "AddMatch", body);
    let reply = client.wait_reply(broker, serial);

    let MessageKind::MethodReturn { .. } = reply.kind() else {
        panic!("AddMatch failed: {reply:?}");
    };
}

#[test]
fn hello_assigns_unique_name() {
    let mut broker = broker();
    let mut client = TestClient::connect(&mut broker);

    let serial = client.call_driver(&mut broker, "Hello", BodyBuf::new());
    let reply = client.wait_reply(&mut broker, serial);

    assert_eq!(reply.message_type(), MessageType::METHOD_RETURN);
    assert_eq!(reply.sender(), Some(DRIVER_NAME));

    let unique = reply.body().read::<str>().unwrap();
    assert!(unique.starts_with(":1."), "unexpected unique name {unique}");
    unique[3..].parse::<u32>().unwrap();

    let signal = client.wait_message(&mut broker);
    assert_signal(&signal, "NameAcquired");
    assert_eq!(signal.body().read::<str>().unwrap(), unique);
}

#[test]
fn unique_names_increase_across_connections() {
    let mut broker = broker();

    let a = TestClient::register(&mut broker);
    let b = TestClient::register(&mut broker);

    assert_eq!(a.unique(), ":1.0");
    assert_eq!(b.unique(), ":1.1");
}

#[test]
fn add_match_receives_signal_once() {
    let mut broker = broker();

    let mut a = TestClient::register(&mut broker);
    let mut b = TestClient::register(&mut broker);

    add_match(&mut a, &mut broker, "type='signal'");

    let serial = b.send.next_serial();
    let mut body = BodyBuf::new();
    body.store("hello").unwrap();

    let signal = Message::signal(TEST_PATH, "Baz", serial)
        .with_interface("foo.Bar")
        .with_body(body.as_body());

    b.send_message(&mut broker, &signal);

    let received = a.wait_message(&mut broker);
    assert_signal(&received, "Baz");
    assert_eq!(received.interface(), Some("foo.Bar"));
    assert_eq!(received.sender(), Some(b.unique()));
    assert_eq!(received.serial(), serial);

    // Exactly one copy for the subscriber, nothing for the sender.
    a.assert_silent(&mut broker);
    b.assert_silent(&mut broker);
}

#[test]
fn service_does_not_exist() {
    let mut broker = broker();

    let mut a = TestClient::register(&mut broker);
    let mut other = TestClient::register(&mut broker);

    let serial = a.send.next_serial();
    let call = Message::method_call(TEST_PATH, "Frobnicate", serial)
        .with_interface("com.example.Iface")
        .with_destination("org.example.Missing");

    a.send_message(&mut broker, &call);

    let reply = a.wait_reply(&mut broker, serial);

    let MessageKind::Error {
        error_name,
        reply_serial,
    } = reply.kind()
    else {
        panic!("expected an error reply, got {reply:?}");
    };

    assert_eq!(error_name, err::SERVICE_DOES_NOT_EXIST);
    assert_eq!(reply_serial, serial);

    // Any message type addressed to an unbound name gets the same error.
    let serial = a.send.next_serial();
    let signal = Message::signal(TEST_PATH, "Shout", serial)
        .with_interface("com.example.Iface")
        .with_destination("org.example.Missing");

    a.send_message(&mut broker, &signal);

    let reply = a.wait_reply(&mut broker, serial);

    let MessageKind::Error { error_name, .. } = reply.kind() else {
        panic!("expected an error reply, got {reply:?}");
    };

    assert_eq!(error_name, err::SERVICE_DOES_NOT_EXIST);

    other.assert_silent(&mut broker);
}

#[test]
fn unicast_routes_to_name_owner() {
    let mut broker = broker();

    let mut service = TestClient::register(&mut broker);
    let mut caller = TestClient::register(&mut broker);

    let outcome = request_name(
        &mut service,
        &mut broker,
        "org.example.Echo",
        NameFlag::NONE,
    );
    assert_eq!(outcome, NameReply::PRIMARY_OWNER.get());

    // NameAcquired for the well-known name.
    let signal = service.wait_message(&mut broker);
    assert_signal(&signal, "NameAcquired");

    // Two calls from the same sender arrive in order.
    let first = caller.send.next_serial();
    let call = Message::method_call(TEST_PATH, "One", first)
        .with_interface("com.example.Iface")
        .with_destination("org.example.Echo");
    caller.send_message(&mut broker, &call);

    let second = caller.send.next_serial();
    let call = Message::method_call(TEST_PATH, "Two", second)
        .with_interface("com.example.Iface")
        .with_destination("org.example.Echo");
    caller.send_message(&mut broker, &call);

    let received = service.wait_message(&mut broker);
    assert_eq!(received.serial(), first);
    assert_eq!(received.sender(), Some(caller.unique()));

    let received = service.wait_message(&mut broker);
    assert_eq!(received.serial(), second);
}

#[test]
fn name_handoff_with_replacement() {
    let mut broker = broker();

    let mut a = TestClient::register(&mut broker);
    let mut b = TestClient::register(&mut broker);
    let mut matcher = TestClient::register(&mut broker);

    add_match(&mut matcher, &mut broker, "member='NameOwnerChanged'");

    let outcome = request_name(
        &mut a,
        &mut broker,
        "org.example.X",
        NameFlag::ALLOW_REPLACEMENT,
    );
    assert_eq!(outcome, NameReply::PRIMARY_OWNER.get());
    assert_signal(&a.wait_message(&mut broker), "NameAcquired");

    let change = matcher.wait_message(&mut broker);
    assert_signal(&change, "NameOwnerChanged");

    let outcome = request_name(
        &mut b,
        &mut broker,
        "org.example.X",
        NameFlag::REPLACE_EXISTING,
    );
    assert_eq!(outcome, NameReply::PRIMARY_OWNER.get());

    // The displaced owner hears NameLost, the new owner NameAcquired.
    let lost = a.wait_message(&mut broker);
    assert_signal(&lost, "NameLost");
    assert_eq!(lost.body().read::<str>().unwrap(), "org.example.X");

    let acquired = b.wait_message(&mut broker);
    assert_signal(&acquired, "NameAcquired");
    assert_eq!(acquired.body().read::<str>().unwrap(), "org.example.X");

    // Subscribers observe the handoff with both endpoints filled in.
    let change = matcher.wait_message(&mut broker);
    assert_signal(&change, "NameOwnerChanged");

    let mut body = change.body();
    assert_eq!(body.read::<str>().unwrap(), "org.example.X");
    assert_eq!(body.read::<str>().unwrap(), a.unique());
    assert_eq!(body.read::<str>().unwrap(), b.unique());

    // The registry agrees.
    let mut query = BodyBuf::new();
    query.store("org.example.X").unwrap();
    let serial = a.call_driver(&mut broker, "GetNameOwner", query);
    let reply = a.wait_reply(&mut broker, serial);
    assert_eq!(reply.body().read::<str>().unwrap(), b.unique());
}

#[test]
fn disconnect_promotes_queued_owner() {
    let mut broker = broker();

    let mut a = TestClient::register(&mut broker);
    let mut b = TestClient::register(&mut broker);
    let mut matcher = TestClient::register(&mut broker);

    add_match(&mut matcher, &mut broker, "member='NameOwnerChanged'");

    let outcome = request_name(&mut a, &mut broker, "org.example.X", NameFlag::NONE);
    assert_eq!(outcome, NameReply::PRIMARY_OWNER.get());
    assert_signal(&a.wait_message(&mut broker), "NameAcquired");

    let outcome = request_name(&mut b, &mut broker, "org.example.X", NameFlag::NONE);
    assert_eq!(outcome, NameReply::IN_QUEUE.get());

    let a_unique = a.unique().to_owned();
    let b_unique = b.unique().to_owned();

    // First change: the initial acquisition by A.
    assert_signal(&matcher.wait_message(&mut broker), "NameOwnerChanged");

    drop(a);

    for _ in 0..10 {
        broker.turn(false).unwrap();
    }

    // B is promoted FIFO and told so.
    let acquired = b.wait_message(&mut broker);
    assert_signal(&acquired, "NameAcquired");
    assert_eq!(acquired.body().read::<str>().unwrap(), "org.example.X");

    // The handoff signal carries old and new owner.
    let change = matcher.wait_message(&mut broker);
    assert_signal(&change, "NameOwnerChanged");

    let mut body = change.body();
    assert_eq!(body.read::<str>().unwrap(), "org.example.X");
    assert_eq!(body.read::<str>().unwrap(), a_unique);
    assert_eq!(body.read::<str>().unwrap(), b_unique);

    // And finally the unique name of A going away.
    let change = matcher.wait_message(&mut broker);
    assert_signal(&change, "NameOwnerChanged");

    let mut body = change.body();
    assert_eq!(body.read::<str>().unwrap(), a_unique);
}

#[test]
fn broadcast_commits_atomically_under_memory_pressure() {
    // Inject an allocation failure at every staging site of a broadcast to
    // three subscribers; each time, either all three observe the message or
    // none does, and the sender sees exactly one out-of-memory reply.
    for fail_at in 0..4 {
        let mut broker = broker();

        let mut sender = TestClient::register(&mut broker);
        let mut subscribers = Vec::new();

        for _ in 0..3 {
            let mut subscriber = TestClient::register(&mut broker);
            add_match(&mut subscriber, &mut broker, "member='Blast'");
            subscribers.push(subscriber);
        }

        broker.mem.fail_after(fail_at);

        let serial = sender.send.next_serial();
        let signal = Message::signal(TEST_PATH, "Blast", serial).with_interface("com.example.Iface");
        sender.send_message(&mut broker, &signal);

        for _ in 0..10 {
            broker.turn(false).unwrap();
        }

        let mut delivered = 0;

        for subscriber in &mut subscribers {
            if let Some(message) = subscriber.try_message(&mut broker) {
                assert_signal(&message, "Blast");
                delivered += 1;
                subscriber.assert_silent(&mut broker);
            }
        }

        if fail_at < 3 {
            // The staging failed: no recipient may observe the message.
            assert_eq!(delivered, 0, "partial delivery with fail_at={fail_at}");

            let reply = sender.wait_message(&mut broker);

            let MessageKind::Error {
                error_name,
                reply_serial,
            } = reply.kind()
            else {
                panic!("expected the out-of-memory reply, got {reply:?}");
            };

            assert_eq!(error_name, err::NO_MEMORY);
            assert_eq!(reply_serial, serial);
            sender.assert_silent(&mut broker);
        } else {
            // The injection fell past the last staging site.
            assert_eq!(delivered, 3);
            sender.assert_silent(&mut broker);
        }
    }
}

#[test]
fn remove_match_stops_delivery() {
    let mut broker = broker();

    let mut a = TestClient::register(&mut broker);
    let mut b = TestClient::register(&mut broker);

    add_match(&mut a, &mut broker, "type='signal'");

    let mut body = BodyBuf::new();
    body.store("type='signal'").unwrap();
    let serial = a.call_driver(&mut broker, "RemoveMatch", body);
    let reply = a.wait_reply(&mut broker, serial);
    assert_eq!(reply.message_type(), MessageType::METHOD_RETURN);

    let serial = b.send.next_serial();
    let signal = Message::signal(TEST_PATH, "Quiet", serial).with_interface("com.example.Iface");
    b.send_message(&mut broker, &signal);

    a.assert_silent(&mut broker);
}

#[test]
fn list_names_contains_driver_and_owned_names() {
    let mut broker = broker();

    let mut a = TestClient::register(&mut broker);

    let outcome = request_name(&mut a, &mut broker, "org.example.Listed", NameFlag::NONE);
    assert_eq!(outcome, NameReply::PRIMARY_OWNER.get());
    assert_signal(&a.wait_message(&mut broker), "NameAcquired");

    let serial = a.call_driver(&mut broker, "ListNames", BodyBuf::new());
    let reply = a.wait_reply(&mut broker, serial);

    let body = reply.body();
    let reader = body.reader();
    let mut names = Vec::new();
    let mut elements = reader.recurse().unwrap();

    loop {
        names.push(elements.read_basic().unwrap().as_str().unwrap().to_owned());

        if !elements.next().unwrap() {
            break;
        }
    }

    assert!(names.contains(&String::from(DRIVER_NAME)));
    assert!(names.contains(&String::from("org.example.Listed")));
    assert!(names.contains(&String::from(a.unique())));
}

#[test]
fn unknown_driver_method_errors() {
    let mut broker = broker();

    let mut a = TestClient::register(&mut broker);

    let serial = a.call_driver(&mut broker, "Frobnicate", BodyBuf::new());
    let reply = a.wait_reply(&mut broker, serial);

    let MessageKind::Error { error_name, .. } = reply.kind() else {
        panic!("expected an error, got {reply:?}");
    };

    assert_eq!(error_name, err::UNKNOWN_METHOD);
}

#[test]
fn malformed_preamble_disconnects() {
    let mut broker = broker();

    let mut client = TestClient::connect(&mut broker);

    // A preamble with an unknown endianness marker.
    let garbage = [b'Z', 1, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
    client.write_all(&mut broker, &garbage);

    for _ in 0..10 {
        broker.turn(false).unwrap();
    }

    let mut chunk = [0u8; 16];
    let mut closed = false;

    // The broker closes the connection rather than answering.
    for _ in 0..1000 {
        match client.stream.read(&mut chunk) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(_) => continue,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                broker.turn(false).unwrap();
            }
            Err(_) => {
                closed = true;
                break;
            }
        }
    }

    assert!(closed, "the malformed peer was not disconnected");
}
