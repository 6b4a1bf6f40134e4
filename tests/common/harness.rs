//! tests/common/harness.rs
use bytes::Bytes;
use gatt_tx::{
    Config, ConnectionRegistry, DeviceId, GattClientConnection, GattEvent, GattEventSink,
    GattStatus, RadioError, Transaction, TransactionResult,
    radio::{GattClientHandle, GattRadio, GattServerHandle, WriteType},
    result::Phy,
    transaction::ConnectOperation,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Once},
    time::Duration,
};
use uuid::Uuid;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "gatt_tx=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

/// Native status reported by rejected calls.
pub const REJECT_STATUS: i32 = 0x81;

/// How the mock radio answers one kind of native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Reports success from another thread after a short delay.
    Respond,
    /// Reports the given native status from another thread.
    Fail(i32),
    /// Accepts the call and never reports back.
    Silent,
    /// Refuses to start the call.
    Reject,
}

#[derive(Debug, Default)]
struct MockState {
    replies: Mutex<HashMap<&'static str, Reply>>,
    calls: Mutex<Vec<&'static str>>,
    server_sink: Mutex<Option<GattEventSink>>,
    client_sinks: Mutex<HashMap<DeviceId, GattEventSink>>,
    read_value: Mutex<Bytes>,
}

impl MockState {
    fn record(&self, call: &'static str) -> Reply {
        self.calls.lock().unwrap().push(call);
        self.replies
            .lock()
            .unwrap()
            .get(call)
            .copied()
            .unwrap_or(Reply::Respond)
    }

    /// Pushes the event built for `status` from a radio callback thread.
    fn answer(
        &self,
        reply: Reply,
        sink: &GattEventSink,
        event: impl FnOnce(GattStatus) -> GattEvent,
    ) -> Result<(), RadioError> {
        let status = match reply {
            Reply::Respond => GattStatus::SUCCESS,
            Reply::Fail(code) => GattStatus(code),
            Reply::Silent => return Ok(()),
            Reply::Reject => return Err(RadioError::new(REJECT_STATUS, "mock radio refused")),
        };
        let event = event(status);
        let sink = sink.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            sink.deliver(event);
        });
        Ok(())
    }
}

/// A scripted radio. Every call is answered with [`Reply::Respond`] unless
/// configured otherwise with [`MockRadio::set`].
#[derive(Debug, Default)]
pub struct MockRadio {
    state: Arc<MockState>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        let radio = Self::default();
        *radio.state.read_value.lock().unwrap() = Bytes::from_static(&[0x06, 0x48]);
        Arc::new(radio)
    }

    pub fn set(&self, call: &'static str, reply: Reply) {
        self.state.replies.lock().unwrap().insert(call, reply);
    }

    pub fn set_read_value(&self, value: &'static [u8]) {
        *self.state.read_value.lock().unwrap() = Bytes::from_static(value);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    /// Delivers an event to a client on the calling thread, as a spontaneous
    /// radio callback would.
    pub fn deliver_to_client(&self, device: &DeviceId, event: GattEvent) {
        let sink = self.state.client_sinks.lock().unwrap().get(device).cloned();
        sink.expect("device never connected").deliver(event);
    }

    /// Delivers an event to the open server, as a remote client would cause.
    pub fn deliver_to_server(&self, event: GattEvent) {
        let sink = self.state.server_sink.lock().unwrap().clone();
        sink.expect("server was not opened").deliver(event);
    }
}

#[async_trait::async_trait]
impl GattRadio for MockRadio {
    async fn connect(
        &self,
        device: &DeviceId,
        sink: GattEventSink,
    ) -> Result<Arc<dyn GattClientHandle>, RadioError> {
        let reply = self.state.record("connect");
        self.state
            .client_sinks
            .lock()
            .unwrap()
            .insert(device.clone(), sink.clone());
        self.state.answer(reply, &sink, |status| GattEvent::ConnectionStateChanged {
            status,
            connected: status == GattStatus::SUCCESS,
        })?;
        Ok(Arc::new(MockClientHandle {
            state: self.state.clone(),
            sink,
        }))
    }

    async fn open_server(&self, sink: GattEventSink) -> Result<Arc<dyn GattServerHandle>, RadioError> {
        self.state.record("open_server");
        *self.state.server_sink.lock().unwrap() = Some(sink.clone());
        Ok(Arc::new(MockServerHandle {
            state: self.state.clone(),
            sink,
        }))
    }
}

#[derive(Debug)]
struct MockClientHandle {
    state: Arc<MockState>,
    sink: GattEventSink,
}

#[async_trait::async_trait]
impl GattClientHandle for MockClientHandle {
    async fn disconnect(&self) -> Result<(), RadioError> {
        let reply = self.state.record("disconnect");
        self.state.answer(reply, &self.sink, |status| GattEvent::ConnectionStateChanged {
            status,
            connected: false,
        })
    }

    fn close(&self) {
        self.state.record("close");
    }

    async fn discover_services(&self) -> Result<(), RadioError> {
        let reply = self.state.record("discover_services");
        self.state.answer(reply, &self.sink, |status| GattEvent::ServicesDiscovered {
            status,
            services: vec![HEART_RATE_SERVICE, BATTERY_SERVICE],
        })
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), RadioError> {
        let reply = self.state.record("read_characteristic");
        let value = self.state.read_value.lock().unwrap().clone();
        self.state.answer(reply, &self.sink, |status| GattEvent::CharacteristicRead {
            status,
            service,
            characteristic,
            value,
        })
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        _value: Bytes,
        _write_type: WriteType,
    ) -> Result<(), RadioError> {
        let reply = self.state.record("write_characteristic");
        self.state.answer(reply, &self.sink, |status| GattEvent::CharacteristicWrite {
            status,
            service,
            characteristic,
        })
    }

    async fn write_descriptor(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        _value: Bytes,
    ) -> Result<(), RadioError> {
        let reply = self.state.record("write_descriptor");
        self.state.answer(reply, &self.sink, |status| GattEvent::DescriptorWrite {
            status,
            characteristic,
            descriptor,
        })
    }

    async fn request_mtu(&self, mtu: u16) -> Result<(), RadioError> {
        let reply = self.state.record("request_mtu");
        // 模拟外设只支持较小的MTU
        let negotiated = mtu.min(185);
        self.state.answer(reply, &self.sink, |status| GattEvent::MtuChanged {
            status,
            mtu: negotiated,
        })
    }

    async fn read_rssi(&self) -> Result<(), RadioError> {
        let reply = self.state.record("read_rssi");
        self.state
            .answer(reply, &self.sink, |status| GattEvent::RssiRead { status, rssi: -61 })
    }

    async fn set_preferred_phy(&self, tx: Phy, rx: Phy) -> Result<(), RadioError> {
        let reply = self.state.record("set_preferred_phy");
        self.state.answer(reply, &self.sink, |status| GattEvent::PhyUpdated {
            status,
            tx_phy: tx,
            rx_phy: rx,
        })
    }
}

#[derive(Debug)]
struct MockServerHandle {
    state: Arc<MockState>,
    sink: GattEventSink,
}

#[async_trait::async_trait]
impl GattServerHandle for MockServerHandle {
    async fn add_service(&self, service: Uuid, _characteristics: Vec<Uuid>) -> Result<(), RadioError> {
        let reply = self.state.record("add_service");
        self.state
            .answer(reply, &self.sink, |status| GattEvent::ServiceAdded { status, service })
    }

    fn close(&self) {
        self.state.record("close_server");
    }
}

/// A registry over a [`MockRadio`].
pub struct TestHarness {
    pub radio: Arc<MockRadio>,
    pub registry: Arc<ConnectionRegistry>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let radio = MockRadio::new();
        let registry = ConnectionRegistry::new(radio.clone(), config);
        Self { radio, registry }
    }

    /// A short timeout so timeout paths finish quickly.
    pub fn fast() -> Self {
        let mut config = Config::default();
        config.transaction.default_timeout = Duration::from_millis(150);
        Self::with_config(config)
    }

    pub fn client(&self, address: &str) -> Arc<GattClientConnection> {
        self.registry.client(&DeviceId::new(address))
    }

    /// Returns a client that has completed a connect transaction.
    pub async fn connected_client(&self, address: &str) -> Arc<GattClientConnection> {
        let client = self.client(address);
        let result = run(&client, Transaction::new(&client, ConnectOperation::new())).await;
        assert!(result.is_success(), "connect failed: {result:?}");
        client
    }
}

/// Submits `tx` to `client` and waits for its result.
pub async fn run(client: &Arc<GattClientConnection>, tx: Transaction) -> TransactionResult {
    tokio::time::timeout(Duration::from_secs(5), client.run_tx_and_wait(tx))
        .await
        .expect("transaction did not finish")
        .expect("transaction was not accepted")
}
