#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use netbridge::{BridgeConfig, Endpoint, Engine, SimStack};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub fn config() -> BridgeConfig {
    BridgeConfig {
        timer_interval: Duration::from_millis(10),
        ..BridgeConfig::default()
    }
}

pub fn start(stack: SimStack, cfg: &BridgeConfig) -> Engine<SimStack> {
    init_tracing();
    Engine::start(stack, cfg).unwrap()
}

pub fn endpoint(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16) -> Endpoint {
    Endpoint::new(
        SocketAddrV4::new(Ipv4Addr::from(src), src_port),
        SocketAddrV4::new(Ipv4Addr::from(dst), dst_port),
    )
}

/// Poll `cond` until it holds, failing the test after a generous timeout.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
