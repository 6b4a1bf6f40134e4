//! 测试辅助工具模块
//! Test utilities module

#![cfg(test)]

use crate::{
    config::Config,
    connection::GattClientConnection,
    error::RadioError,
    event::{DeviceId, GattEvent, GattEventSink},
    guard::TransactionCategory,
    radio::{GattClientHandle, GattRadio, GattServerHandle, WriteType},
    result::{Phy, TransactionResult, TransactionStatus},
    state::GattState,
    transaction::{GattOperation, Outcome, TransactionContext},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

/// A radio that accepts every operation and never calls back.
#[derive(Debug)]
pub struct NullRadio;

#[derive(Debug)]
pub struct SilentClientHandle;

#[derive(Debug)]
pub struct SilentServerHandle;

#[async_trait]
impl GattRadio for NullRadio {
    async fn connect(
        &self,
        _device: &DeviceId,
        _sink: GattEventSink,
    ) -> Result<Arc<dyn GattClientHandle>, RadioError> {
        Ok(Arc::new(SilentClientHandle))
    }

    async fn open_server(&self, _sink: GattEventSink) -> Result<Arc<dyn GattServerHandle>, RadioError> {
        // 让并发的调用者有机会交错执行
        tokio::task::yield_now().await;
        Ok(Arc::new(SilentServerHandle))
    }
}

#[async_trait]
impl GattClientHandle for SilentClientHandle {
    async fn disconnect(&self) -> Result<(), RadioError> {
        Ok(())
    }
    fn close(&self) {}
    async fn discover_services(&self) -> Result<(), RadioError> {
        Ok(())
    }
    async fn read_characteristic(&self, _: Uuid, _: Uuid) -> Result<(), RadioError> {
        Ok(())
    }
    async fn write_characteristic(&self, _: Uuid, _: Uuid, _: Bytes, _: WriteType) -> Result<(), RadioError> {
        Ok(())
    }
    async fn write_descriptor(&self, _: Uuid, _: Uuid, _: Uuid, _: Bytes) -> Result<(), RadioError> {
        Ok(())
    }
    async fn request_mtu(&self, _: u16) -> Result<(), RadioError> {
        Ok(())
    }
    async fn read_rssi(&self) -> Result<(), RadioError> {
        Ok(())
    }
    async fn set_preferred_phy(&self, _: Phy, _: Phy) -> Result<(), RadioError> {
        Ok(())
    }
}

#[async_trait]
impl GattServerHandle for SilentServerHandle {
    async fn add_service(&self, _: Uuid, _: Vec<Uuid>) -> Result<(), RadioError> {
        Ok(())
    }
    fn close(&self) {}
}

/// A client connection outside any registry, starting in `state`.
pub fn client_in_state(state: GattState, config: Config) -> Arc<GattClientConnection> {
    let client = GattClientConnection::new(
        DeviceId::new("00:11:22:33:44:55"),
        Arc::new(NullRadio),
        Arc::new(config),
        Weak::new(),
    );
    client.set_state(state);
    client
}

/// A short default timeout so timeout paths finish quickly in real time.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.transaction.default_timeout = Duration::from_millis(200);
    config
}

/// How a [`ScriptedOperation`] finishes.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Completes inside `execute` with the given status.
    Immediate(TransactionStatus),
    /// Completes from a spawned thread after the delay.
    Delayed(Duration, TransactionStatus),
    /// Waits for a `CharacteristicChanged` event and succeeds.
    OnEvent,
    /// Never completes.
    Never,
}

/// Shared record of what scripted operations did.
#[derive(Debug, Default)]
pub struct Journal {
    pub executed: Mutex<Vec<&'static str>>,
    pub timeouts: AtomicUsize,
    running: AtomicUsize,
    pub overlaps: AtomicUsize,
}

impl Journal {
    pub fn executed(&self) -> Vec<&'static str> {
        self.executed.lock().unwrap().clone()
    }
}

/// An operation whose behaviour is fixed by a [`Script`].
#[derive(Debug)]
pub struct ScriptedOperation {
    name: &'static str,
    target: GattState,
    category: TransactionCategory,
    script: Script,
    settle: Option<GattState>,
    journal: Arc<Journal>,
}

impl ScriptedOperation {
    pub fn new(name: &'static str, script: Script, journal: &Arc<Journal>) -> Self {
        Self {
            name,
            target: GattState::ReadCharacteristicSuccess,
            category: TransactionCategory::Ordinary,
            script,
            settle: None,
            journal: journal.clone(),
        }
    }

    pub fn targeting(mut self, target: GattState) -> Self {
        self.target = target;
        self
    }

    pub fn with_category(mut self, category: TransactionCategory) -> Self {
        self.category = category;
        self
    }

    /// Moves the connection to `state` when the operation completes.
    pub fn settling(mut self, state: GattState) -> Self {
        self.settle = Some(state);
        self
    }

    fn outcome(&self, result: TransactionResult) -> Outcome {
        settled(self.settle, result)
    }

    fn finish(&self, ctx: &TransactionContext, status: TransactionStatus) {
        self.journal.running.fetch_sub(1, Ordering::SeqCst);
        ctx.finish(self.outcome(TransactionResult::new(status, self.target)));
    }
}

fn settled(settle: Option<GattState>, result: TransactionResult) -> Outcome {
    match settle {
        Some(state) => Outcome::new(result).then_state(state),
        None => Outcome::new(result),
    }
}

#[async_trait]
impl GattOperation for ScriptedOperation {
    fn name(&self) -> &'static str {
        self.name
    }

    fn target_state(&self) -> GattState {
        self.target
    }

    fn category(&self) -> TransactionCategory {
        self.category
    }

    async fn execute(&self, ctx: &TransactionContext) {
        self.journal.executed.lock().unwrap().push(self.name);
        if self.journal.running.fetch_add(1, Ordering::SeqCst) > 0 {
            self.journal.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        match self.script {
            Script::Immediate(status) => self.finish(ctx, status),
            Script::Delayed(delay, status) => {
                let ctx = ctx.clone();
                let journal = self.journal.clone();
                let target = self.target;
                let settle = self.settle;
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    // 超时已经计过数
                    if !ctx.is_complete() {
                        journal.running.fetch_sub(1, Ordering::SeqCst);
                    }
                    ctx.finish(settled(settle, TransactionResult::new(status, target)));
                });
            }
            Script::OnEvent | Script::Never => {}
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        match (self.script, event) {
            (Script::OnEvent, GattEvent::CharacteristicChanged { value, .. }) => {
                self.journal.running.fetch_sub(1, Ordering::SeqCst);
                Some(self.outcome(
                    TransactionResult::builder(TransactionStatus::Success, self.target)
                        .data(value.clone())
                        .build(),
                ))
            }
            _ => None,
        }
    }

    async fn on_timeout(&self, _ctx: &TransactionContext) {
        self.journal.running.fetch_sub(1, Ordering::SeqCst);
        self.journal.timeouts.fetch_add(1, Ordering::SeqCst);
    }
}
