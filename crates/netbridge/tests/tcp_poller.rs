mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{config, endpoint, start, wait_until};
use netbridge::{
    BridgeConfig, BridgeError, Engine, EngineError, PollEvent, Readiness, ReadOutcome,
    SimConnState, SimStack, TcpPoller, WriteOutcome,
};

fn open(stack: SimStack, cfg: BridgeConfig) -> (Engine<SimStack>, Arc<TcpPoller<SimStack>>) {
    let engine = start(stack, &cfg);
    let poller = TcpPoller::open(&engine.handle(), &cfg).unwrap();
    (engine, Arc::new(poller))
}

fn readable(index: u16) -> PollEvent {
    PollEvent {
        index,
        readiness: Readiness::READABLE,
    }
}

#[test]
fn accept_assigns_lowest_free_index() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep1 = endpoint([10, 0, 0, 2], 40000, [1, 1, 1, 1], 443);
    let ep2 = endpoint([10, 0, 0, 2], 40001, [8, 8, 8, 8], 53);

    let c1 = engine.with_core(|s| {
        let c1 = s.connect(ep1).unwrap();
        s.connect(ep2).unwrap();
        c1
    });
    assert_eq!(engine.with_core(|s| s.conn_endpoint(c1)), Some(ep1));

    assert_eq!(poller.accept().unwrap(), (0, ep1));
    assert_eq!(poller.accept().unwrap(), (1, ep2));
    assert_eq!(poller.endpoint(1).unwrap(), ep2);
    assert_eq!(poller.stats().accepted, 2);
}

#[test]
fn capacity_one_rejects_the_second_connection() {
    let cfg = BridgeConfig {
        tcp_capacity: 1,
        ..config()
    };
    let (engine, poller) = open(SimStack::new(), cfg);
    let ep1 = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let ep2 = endpoint([10, 0, 0, 3], 1001, [1, 1, 1, 1], 80);

    let (c1, c2) = engine.with_core(|s| (s.connect(ep1).unwrap(), s.connect(ep2).unwrap()));

    // The first accept completes without waiting on the second connection.
    assert_eq!(poller.accept().unwrap(), (0, ep1));

    let acceptor = {
        let poller = Arc::clone(&poller);
        thread::spawn(move || poller.accept())
    };
    wait_until("second connection to be rejected", || {
        engine.with_core(|s| s.is_aborted(c2))
    });
    assert_eq!(poller.stats().rejected_capacity, 1);
    assert_eq!(engine.with_core(|s| s.conn_state(c1)), Some(SimConnState::Open));

    poller.close();
    assert_eq!(acceptor.join().unwrap(), Err(BridgeError::Closed));
}

#[test]
fn full_accept_backlog_rejects_inside_the_engine() {
    let cfg = BridgeConfig {
        accept_backlog: 1,
        ..config()
    };
    let (engine, poller) = open(SimStack::new(), cfg);
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);

    let (c1, c2) = engine.with_core(|s| (s.connect(ep).unwrap(), s.connect(ep).unwrap()));
    assert!(!engine.with_core(|s| s.is_aborted(c1)));
    assert!(engine.with_core(|s| s.is_aborted(c2)));
    assert_eq!(poller.stats().rejected_backlog, 1);
    assert_eq!(poller.accept().unwrap().0, 0);
}

#[test]
fn read_copies_partially_and_acknowledges_only_consumed_bytes() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    let mut buf = [0u8; 5];
    assert_eq!(poller.read(index, &mut buf).unwrap(), ReadOutcome::NotReady);

    engine.with_core(|s| s.deliver(conn, b"hello world"));
    assert_eq!(poller.events(16).unwrap(), vec![readable(index)]);

    assert_eq!(poller.read(index, &mut buf).unwrap(), ReadOutcome::Data(5));
    assert_eq!(&buf, b"hello");
    assert_eq!(engine.with_core(|s| s.recved(conn)), 5);

    let mut big = [0u8; 64];
    assert_eq!(poller.read(index, &mut big).unwrap(), ReadOutcome::Data(6));
    assert_eq!(&big[..6], b" world");
    assert_eq!(engine.with_core(|s| s.recved(conn)), 11);

    assert_eq!(poller.read(index, &mut big).unwrap(), ReadOutcome::NotReady);

    // Drained, so readiness was re-armed.
    engine.with_core(|s| s.deliver(conn, b"again"));
    assert_eq!(poller.events(16).unwrap(), vec![readable(index)]);
    assert_eq!(poller.read(index, &mut big).unwrap(), ReadOutcome::Data(5));
}

#[test]
fn data_received_before_accept_is_not_lost() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    engine.with_core(|s| {
        let conn = s.connect(ep).unwrap();
        s.deliver(conn, b"early");
    });

    let (index, _) = poller.accept().unwrap();
    assert_eq!(poller.events(16).unwrap(), vec![readable(index)]);
    let mut buf = [0u8; 16];
    assert_eq!(poller.read(index, &mut buf).unwrap(), ReadOutcome::Data(5));
    assert_eq!(&buf[..5], b"early");
}

#[test]
fn eof_is_reported_after_buffered_data() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    engine.with_core(|s| {
        s.deliver(conn, b"bye");
        s.deliver_eof(conn);
    });
    assert_eq!(poller.events(16).unwrap(), vec![readable(index)]);

    let mut buf = [0u8; 16];
    assert_eq!(poller.read(index, &mut buf).unwrap(), ReadOutcome::Data(3));
    assert_eq!(poller.read(index, &mut buf).unwrap(), ReadOutcome::Eof);
    assert_eq!(poller.read(index, &mut buf).unwrap(), ReadOutcome::Eof);
}

#[test]
fn write_would_block_until_pending_bytes_are_sent() {
    let (engine, poller) = open(SimStack::new().with_send_buffer(4), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    assert_eq!(
        poller.write(index, b"hello world").unwrap(),
        WriteOutcome::Accepted(11)
    );
    assert_eq!(engine.with_core(|s| s.written(conn).to_vec()), b"hell");
    assert_eq!(poller.outstanding(index).unwrap(), 11);

    assert_eq!(poller.write(index, b"x").unwrap(), WriteOutcome::WouldBlock);
    assert_eq!(poller.stats().would_block, 1);

    // The peer acknowledges; the pending remainder is pushed on the engine thread.
    engine.with_core(|s| s.acknowledge(conn, 4));
    engine.call(|_| ()).unwrap();
    assert_eq!(engine.with_core(|s| s.written(conn).to_vec()), b"hello wo");
    assert_eq!(poller.outstanding(index).unwrap(), 7);
    assert_eq!(poller.write(index, b"x").unwrap(), WriteOutcome::WouldBlock);

    engine.with_core(|s| s.acknowledge(conn, 4));
    engine.call(|_| ()).unwrap();
    assert_eq!(engine.with_core(|s| s.written(conn).to_vec()), b"hello world");
    assert_eq!(
        poller.events(16).unwrap(),
        vec![PollEvent {
            index,
            readiness: Readiness::WRITABLE,
        }]
    );

    assert_eq!(
        poller.write(index, b"next").unwrap(),
        WriteOutcome::Accepted(4)
    );
    assert_eq!(engine.with_core(|s| s.take_written(conn)), b"hello worldn");
    assert!(engine.with_core(|s| s.written(conn).is_empty()));
}

fn writable(index: u16) -> PollEvent {
    PollEvent {
        index,
        readiness: Readiness::WRITABLE,
    }
}

#[test]
fn write_refused_for_memory_is_retried_by_the_timer() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    engine.with_core(|s| s.fail_writes(Some(EngineError::Mem)));
    assert_eq!(
        poller.write(index, b"data").unwrap(),
        WriteOutcome::Accepted(4)
    );
    assert!(engine.with_core(|s| s.written(conn).is_empty()));
    assert_eq!(poller.write(index, b"x").unwrap(), WriteOutcome::WouldBlock);

    // Nothing is in flight, so no `Sent` will ever come; only the periodic poll retries.
    engine.with_core(|s| s.fail_writes(None));
    wait_until("pending write to reach the engine", || {
        engine.with_core(|s| s.written(conn) == b"data")
    });
    assert_eq!(poller.events(16).unwrap(), vec![writable(index)]);
    assert_eq!(
        poller.write(index, b"more").unwrap(),
        WriteOutcome::Accepted(4)
    );
}

#[test]
fn write_stalled_on_an_empty_send_buffer_resumes_when_space_opens() {
    let (engine, poller) = open(SimStack::new().with_send_buffer(0), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    assert_eq!(
        poller.write(index, b"data").unwrap(),
        WriteOutcome::Accepted(4)
    );
    assert!(engine.with_core(|s| s.written(conn).is_empty()));
    assert_eq!(poller.write(index, b"x").unwrap(), WriteOutcome::WouldBlock);

    engine.with_core(|s| s.set_send_buffer(16));
    wait_until("pending write to reach the engine", || {
        engine.with_core(|s| s.written(conn) == b"data")
    });
    assert_eq!(poller.events(16).unwrap(), vec![writable(index)]);
    assert_eq!(poller.outstanding(index).unwrap(), 4);
}

#[test]
fn closed_index_is_reused_only_after_engine_confirms_teardown() {
    let cfg = BridgeConfig {
        tcp_capacity: 1,
        ..config()
    };
    let (engine, poller) = open(SimStack::new(), cfg);
    let ep1 = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let ep2 = endpoint([10, 0, 0, 3], 1000, [1, 1, 1, 1], 80);
    let ep3 = endpoint([10, 0, 0, 4], 1000, [1, 1, 1, 1], 80);

    let c1 = engine.with_core(|s| s.connect(ep1).unwrap());
    assert_eq!(poller.accept().unwrap(), (0, ep1));

    poller.close_index(0).unwrap();
    poller.close_index(0).unwrap();
    assert_eq!(engine.with_core(|s| s.conn_state(c1)), Some(SimConnState::Closing));

    let mut buf = [0u8; 8];
    assert_eq!(poller.read(0, &mut buf), Err(BridgeError::Closed));
    assert_eq!(poller.write(0, b"x"), Err(BridgeError::Closed));

    // Index 0 is still reserved for the closing connection.
    let acceptor = {
        let poller = Arc::clone(&poller);
        thread::spawn(move || poller.accept())
    };
    let c2 = engine.with_core(|s| s.connect(ep2).unwrap());
    wait_until("connection to be rejected for lack of an index", || {
        engine.with_core(|s| s.is_aborted(c2))
    });
    assert_eq!(poller.stats().released, 0);

    assert!(engine.with_core(|s| s.confirm_closed(c1)));
    assert_eq!(poller.stats().released, 1);

    engine.with_core(|s| s.connect(ep3).unwrap());
    assert_eq!(acceptor.join().unwrap(), Ok((0, ep3)));
}

#[test]
fn reset_wakes_both_directions_then_reports_closed() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    engine.with_core(|s| s.reset(conn));
    assert_eq!(
        poller.events(16).unwrap(),
        vec![PollEvent {
            index,
            readiness: Readiness::READABLE | Readiness::WRITABLE,
        }]
    );

    let mut buf = [0u8; 8];
    assert_eq!(poller.read(index, &mut buf), Err(BridgeError::Closed));
    assert_eq!(poller.write(index, b"x"), Err(BridgeError::Closed));
    assert_eq!(poller.stats().released, 0);

    // The engine already let go, so closing frees the index at once.
    poller.close_index(index).unwrap();
    assert_eq!(poller.stats().released, 1);
    assert_eq!(poller.endpoint(index), Err(BridgeError::NotActive(index)));
}

#[test]
fn events_queued_for_a_released_index_are_discarded() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep1 = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let ep2 = endpoint([10, 0, 0, 3], 1000, [1, 1, 1, 1], 80);

    let c1 = engine.with_core(|s| s.connect(ep1).unwrap());
    assert_eq!(poller.accept().unwrap().0, 0);
    engine.with_core(|s| {
        s.deliver(c1, b"stale");
        s.reset(c1);
    });
    poller.close_index(0).unwrap();

    let c2 = engine.with_core(|s| s.connect(ep2).unwrap());
    assert_eq!(poller.accept().unwrap(), (0, ep2));
    engine.with_core(|s| s.deliver(c2, b"fresh"));

    // Without tombstoning, the stale READABLE|WRITABLE would be merged in here.
    assert_eq!(poller.events(16).unwrap(), vec![readable(0)]);
}

#[test]
fn events_merge_records_for_the_same_index() {
    let (engine, poller) = open(SimStack::new().with_send_buffer(1), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    poller.write(index, b"ab").unwrap();
    assert_eq!(poller.write(index, b"c").unwrap(), WriteOutcome::WouldBlock);

    engine.with_core(|s| s.deliver(conn, b"in"));
    engine.with_core(|s| s.acknowledge(conn, 1));
    engine.call(|_| ()).unwrap();

    assert_eq!(
        poller.events(16).unwrap(),
        vec![PollEvent {
            index,
            readiness: Readiness::READABLE | Readiness::WRITABLE,
        }]
    );
}

#[test]
fn listener_teardown_unblocks_accept() {
    let (engine, poller) = open(SimStack::new(), config());

    let acceptor = {
        let poller = Arc::clone(&poller);
        thread::spawn(move || poller.accept())
    };
    thread::sleep(Duration::from_millis(20));

    engine.with_core(|s| s.close_listener());
    assert_eq!(acceptor.join().unwrap(), Err(BridgeError::Closed));
    assert_eq!(poller.accept(), Err(BridgeError::Closed));

    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    assert_eq!(engine.with_core(|s| s.connect(ep)), None);
}

#[test]
fn connection_queued_ahead_of_listener_teardown_is_still_accepted() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);

    let (c1, c2) = engine.with_core(|s| {
        let c1 = s.connect(ep).unwrap();
        s.close_listener();
        (c1, s.connect(ep))
    });
    assert_eq!(c2, None);

    // The connection queued ahead of the teardown is still handed out.
    assert_eq!(poller.accept().unwrap(), (0, ep));
    assert_eq!(poller.accept(), Err(BridgeError::Closed));
    assert_eq!(engine.with_core(|s| s.conn_state(c1)), Some(SimConnState::Open));
}

#[test]
fn close_wakes_event_waiters_and_aborts_connections() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);
    let conn = engine.with_core(|s| s.connect(ep).unwrap());
    let (index, _) = poller.accept().unwrap();

    let waiter = {
        let poller = Arc::clone(&poller);
        thread::spawn(move || poller.events(8))
    };
    thread::sleep(Duration::from_millis(20));

    poller.close();
    poller.close();
    assert_eq!(waiter.join().unwrap(), Err(BridgeError::Closed));
    assert!(engine.with_core(|s| s.is_aborted(conn)));

    let mut buf = [0u8; 8];
    assert_eq!(poller.read(index, &mut buf), Err(BridgeError::Closed));
    assert_eq!(poller.accept(), Err(BridgeError::Closed));
    assert_eq!(poller.close_index(index), Err(BridgeError::Closed));
}

#[test]
fn accept_racing_close_aborts_the_connection() {
    let (engine, poller) = open(SimStack::new(), config());
    let ep = endpoint([10, 0, 0, 2], 1000, [1, 1, 1, 1], 80);

    // Hold the core lock so the acceptor stalls right before activating its index while close
    // marks the poller closed.
    let (conn, acceptor, closer) = engine.with_core(|s| {
        let conn = s.connect(ep).unwrap();
        let acceptor = {
            let poller = Arc::clone(&poller);
            thread::spawn(move || poller.accept())
        };
        thread::sleep(Duration::from_millis(50));
        let closer = {
            let poller = Arc::clone(&poller);
            thread::spawn(move || poller.close())
        };
        wait_until("poller to be marked closed", || poller.is_closed());
        (conn, acceptor, closer)
    });

    assert_eq!(acceptor.join().unwrap(), Err(BridgeError::Closed));
    closer.join().unwrap();
    assert!(engine.with_core(|s| s.is_aborted(conn)));
    assert_eq!(poller.stats().accepted, 0);
}

#[test]
fn index_validation() {
    let cfg = BridgeConfig {
        tcp_capacity: 4,
        ..config()
    };
    let (_engine, poller) = open(SimStack::new(), cfg);

    let mut buf = [0u8; 8];
    assert_eq!(
        poller.read(999, &mut buf),
        Err(BridgeError::InvalidIndex {
            index: 999,
            capacity: 4
        })
    );
    assert_eq!(poller.read(1, &mut buf), Err(BridgeError::NotActive(1)));
    assert_eq!(poller.write(1, b"x"), Err(BridgeError::NotActive(1)));
    assert_eq!(poller.close_index(1), Ok(()));
}
