use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use warden_core::ipc::{decode_payload, Caller, IpcHandler, IpcRequest, IpcResponse};
use warden_core::Engine;

/// Routes control-socket requests into the engine.
pub struct ControlHandler {
    engine: Arc<Engine>,
}

impl ControlHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl IpcHandler for ControlHandler {
    async fn handle(&self, caller: Caller, req: IpcRequest) -> Result<IpcResponse> {
        match req {
            IpcRequest::Ping => Ok(IpcResponse::Pong),
            IpcRequest::Status => Ok(IpcResponse::Status {
                status: self.engine.status(),
            }),
            IpcRequest::Control { code, payload } => {
                let payload = match decode_payload(&payload) {
                    Ok(p) => p,
                    Err(e) => {
                        return Ok(IpcResponse::Rejected {
                            error: e.to_string(),
                        })
                    }
                };
                match self.engine.handle_control(caller.pid, code, &payload) {
                    Ok(()) => {
                        info!(pid = caller.pid, code, "control command applied");
                        Ok(IpcResponse::Done)
                    }
                    Err(e) => {
                        warn!(pid = caller.pid, code, error = %e, "control command rejected");
                        Ok(IpcResponse::Rejected {
                            error: e.to_string(),
                        })
                    }
                }
            }
        }
    }
}
