mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{config, endpoint, start};
use netbridge::{BridgeConfig, BridgeError, SimStack, UdpConn};

#[test]
fn recv_reports_endpoint_and_payload() {
    let cfg = config();
    let engine = start(SimStack::new(), &cfg);
    let udp = UdpConn::listen(&engine.handle(), &cfg).unwrap();
    let ep = endpoint([10, 0, 0, 2], 5353, [8, 8, 8, 8], 53);

    assert!(engine.with_core(|s| s.deliver_datagram(ep, b"query")));

    let mut buf = [0u8; 64];
    assert_eq!(udp.recv(&mut buf).unwrap(), (ep, 5));
    assert_eq!(&buf[..5], b"query");
    assert_eq!(udp.stats().received, 1);
}

#[test]
fn zero_length_datagram_is_delivered() {
    let cfg = config();
    let engine = start(SimStack::new(), &cfg);
    let udp = UdpConn::listen(&engine.handle(), &cfg).unwrap();
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 2000);

    engine.with_core(|s| s.deliver_datagram(ep, b""));
    let mut buf = [0u8; 8];
    assert_eq!(udp.recv(&mut buf).unwrap(), (ep, 0));
}

#[test]
fn datagram_larger_than_buffer_is_dropped_whole() {
    let cfg = config();
    let engine = start(SimStack::new(), &cfg);
    let udp = UdpConn::listen(&engine.handle(), &cfg).unwrap();
    let big = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 2000);
    let small = endpoint([10, 0, 0, 3], 1000, [1, 1, 1, 1], 2000);

    engine.with_core(|s| {
        s.deliver_datagram(big, &[0xaa; 100]);
        s.deliver_datagram(small, b"fits");
    });

    let mut buf = [0u8; 10];
    assert_eq!(udp.recv(&mut buf).unwrap(), (small, 4));
    assert_eq!(&buf[..4], b"fits");

    let stats = udp.stats();
    assert_eq!(stats.dropped_oversized, 1);
    assert_eq!(stats.received, 1);
}

#[test]
fn sendto_transmits_on_the_engine_thread() {
    let cfg = config();
    let engine = start(SimStack::new(), &cfg);
    let udp = UdpConn::listen(&engine.handle(), &cfg).unwrap();
    let ep = endpoint([1, 1, 1, 1], 53, [10, 0, 0, 2], 5353);

    assert_eq!(udp.sendto(ep, b"answer").unwrap(), 6);
    assert_eq!(udp.sendto(ep, b"").unwrap(), 0);
    engine.call(|_| ()).unwrap();

    assert_eq!(
        engine.with_core(|s| s.take_datagrams()),
        vec![(ep, b"answer".to_vec()), (ep, Vec::new())]
    );
    assert_eq!(udp.stats().sent, 2);
}

#[test]
fn full_mailbox_drops_newest_datagrams() {
    let cfg = BridgeConfig {
        udp_mailbox_capacity: 2,
        ..config()
    };
    let engine = start(SimStack::new(), &cfg);
    let udp = UdpConn::listen(&engine.handle(), &cfg).unwrap();
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 2000);

    engine.with_core(|s| {
        for payload in [b"a", b"b", b"c"] {
            s.deliver_datagram(ep, payload);
        }
    });
    assert_eq!(udp.stats().dropped_full, 1);

    let mut buf = [0u8; 8];
    udp.recv(&mut buf).unwrap();
    assert_eq!(buf[0], b'a');
    udp.recv(&mut buf).unwrap();
    assert_eq!(buf[0], b'b');
}

#[test]
fn close_drops_queued_datagrams_and_wakes_receivers() {
    let cfg = config();
    let engine = start(SimStack::new(), &cfg);
    let udp = Arc::new(UdpConn::listen(&engine.handle(), &cfg).unwrap());
    assert_eq!(engine.with_core(|s| s.udp_socket_count()), 1);

    let receiver = {
        let udp = Arc::clone(&udp);
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            udp.recv(&mut buf)
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!receiver.is_finished());

    udp.close();
    assert_eq!(receiver.join().unwrap(), Err(BridgeError::Closed));
    assert_eq!(engine.with_core(|s| s.udp_socket_count()), 0);

    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 2000);
    assert_eq!(udp.sendto(ep, b"late"), Err(BridgeError::Closed));
    assert!(!engine.with_core(|s| s.deliver_datagram(ep, b"late")));
}

#[test]
fn close_counts_datagrams_left_in_the_mailbox() {
    let cfg = config();
    let engine = start(SimStack::new(), &cfg);
    let udp = UdpConn::listen(&engine.handle(), &cfg).unwrap();
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 2000);

    engine.with_core(|s| {
        s.deliver_datagram(ep, b"one");
        s.deliver_datagram(ep, b"two");
    });
    udp.close();
    udp.close();

    assert_eq!(udp.stats().dropped_on_close, 2);
    let mut buf = [0u8; 8];
    assert_eq!(udp.recv(&mut buf), Err(BridgeError::Closed));
}

#[test]
fn sendto_reports_busy_engine_and_counts_the_failure() {
    let cfg = BridgeConfig {
        task_queue_capacity: 1,
        ..config()
    };
    let engine = start(SimStack::new(), &cfg);
    let udp = UdpConn::listen(&engine.handle(), &cfg).unwrap();
    let ep = endpoint([1, 1, 1, 1], 53, [10, 0, 0, 2], 5353);

    // Park the engine thread so the single queue slot stays occupied.
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    engine
        .submit(move |_| {
            entered_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
    entered_rx.recv().unwrap();

    assert_eq!(udp.sendto(ep, b"first").unwrap(), 5);
    assert_eq!(udp.sendto(ep, b"second"), Err(BridgeError::EngineBusy));
    assert_eq!(udp.stats().send_failed, 1);

    release_tx.send(()).unwrap();
    engine.call(|_| ()).unwrap();
    assert_eq!(
        engine.with_core(|s| s.take_datagrams()),
        vec![(ep, b"first".to_vec())]
    );
    assert_eq!(udp.stats().sent, 1);
}
