//! 服务端叶子操作
//! Server leaf operations

use super::{GattOperation, Outcome, TransactionContext, client_ops::back_to_idle};
use crate::{
    event::GattEvent,
    guard::TransactionCategory,
    result::{TransactionResult, TransactionStatus},
    state::GattState,
};
use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

/// Adds a service to the local GATT server.
///
/// 向本地GATT服务端添加服务。
#[derive(Debug)]
pub struct AddServiceOperation {
    service: Uuid,
    characteristics: Vec<Uuid>,
}

impl AddServiceOperation {
    pub fn new(service: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            service,
            characteristics,
        }
    }

    fn fail(&self, ctx: &TransactionContext, status: i32) {
        let result = TransactionResult::builder(TransactionStatus::Failure, GattState::FailureAddingService)
            .service_uuid(self.service)
            .response_status(status)
            .build();
        ctx.finish(back_to_idle(GattState::FailureAddingService, result));
    }
}

#[async_trait]
impl GattOperation for AddServiceOperation {
    fn name(&self) -> &'static str {
        "add_service"
    }

    fn target_state(&self) -> GattState {
        GattState::AddServiceSuccess
    }

    fn category(&self) -> TransactionCategory {
        TransactionCategory::AddService
    }

    async fn execute(&self, ctx: &TransactionContext) {
        let Some(handle) = ctx.server().and_then(|server| server.native_handle()) else {
            warn!(tx = ctx.transaction_id(), "Local server is not open");
            ctx.complete(TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state()));
            return;
        };
        ctx.set_state(GattState::AddingService);
        if let Err(err) = handle.add_service(self.service, self.characteristics.clone()).await {
            warn!(tx = ctx.transaction_id(), service = %self.service, %err, "Radio rejected service");
            self.fail(ctx, err.status);
        }
    }

    fn on_gatt_event(&self, event: &GattEvent, _ctx: &TransactionContext) -> Option<Outcome> {
        let GattEvent::ServiceAdded { status, service } = event else {
            return None;
        };
        if *service != self.service {
            return None;
        }
        let state = if status.is_success() {
            GattState::AddServiceSuccess
        } else {
            GattState::FailureAddingService
        };
        let result = TransactionResult::builder(status.to_transaction_status(), state)
            .service_uuid(self.service)
            .response_status(status.code())
            .build();
        Some(back_to_idle(state, result))
    }

    async fn on_timeout(&self, ctx: &TransactionContext) {
        ctx.set_state(GattState::Idle);
    }
}

/// Forces the server into a given state, bypassing the guard.
///
/// 强制将服务端设置为指定状态，绕过守卫。
#[derive(Debug)]
pub struct SetServerStateOperation {
    state: GattState,
}

impl SetServerStateOperation {
    pub fn new(state: GattState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl GattOperation for SetServerStateOperation {
    fn name(&self) -> &'static str {
        "set_server_state"
    }

    fn target_state(&self) -> GattState {
        self.state
    }

    fn category(&self) -> TransactionCategory {
        TransactionCategory::StateReset
    }

    async fn execute(&self, ctx: &TransactionContext) {
        if ctx.server().is_none() {
            ctx.complete(TransactionResult::new(TransactionStatus::Failure, ctx.gatt_state()));
            return;
        }
        let result = TransactionResult::new(TransactionStatus::Success, self.state);
        ctx.finish(Outcome::new(result).then_state(self.state));
    }
}
