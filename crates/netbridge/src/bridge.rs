use tracing::debug;

use crate::{BridgeConfig, Device, Engine, EngineHandle, NetStack, Result, TcpPoller, UdpConn};

/// One engine with its device, TCP poller and UDP socket wired up.
pub struct NetBridge<S: NetStack> {
    // Field order is drop order: the components detach before the engine thread stops.
    device: Device<S>,
    tcp: TcpPoller<S>,
    udp: UdpConn<S>,
    engine: Engine<S>,
}

impl<S: NetStack> NetBridge<S> {
    /// Start the engine, attach the device with `config.mtu`, open the TCP poller and bind the UDP
    /// socket.
    ///
    /// On failure everything opened so far is closed again before the error is returned.
    pub fn start(stack: S, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let engine = Engine::start(stack, &config)?;
        let handle = engine.handle();

        let device = Device::attach(&handle, config.mtu, &config)?;
        let tcp = match TcpPoller::open(&handle, &config) {
            Ok(tcp) => tcp,
            Err(err) => {
                device.close();
                return Err(err);
            }
        };
        let udp = match UdpConn::listen(&handle, &config) {
            Ok(udp) => udp,
            Err(err) => {
                tcp.close();
                device.close();
                return Err(err);
            }
        };

        debug!(mtu = device.mtu(), tcp_capacity = tcp.capacity(), "bridge started");
        Ok(Self {
            device,
            tcp,
            udp,
            engine,
        })
    }

    pub fn device(&self) -> &Device<S> {
        &self.device
    }

    pub fn tcp(&self) -> &TcpPoller<S> {
        &self.tcp
    }

    pub fn udp(&self) -> &UdpConn<S> {
        &self.udp
    }

    pub fn engine(&self) -> &EngineHandle<S> {
        &self.engine
    }

    /// Close UDP, TCP and the device, in that order. Idempotent.
    pub fn close(&self) {
        self.udp.close();
        self.tcp.close();
        self.device.close();
    }
}

impl<S: NetStack> Drop for NetBridge<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: NetStack> std::fmt::Debug for NetBridge<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetBridge")
            .field("device", &self.device)
            .field("tcp", &self.tcp)
            .field("udp", &self.udp)
            .field("engine", &self.engine)
            .finish()
    }
}
