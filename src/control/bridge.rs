//! Stack-to-tunnel bridge
//!
//! The embedded stack speaks whole IP packets; the tunnel carries bare
//! transport payloads under session ID 0. The bridge translates in both
//! directions: a pump drains the stack's virtual NIC, strips the IP header
//! and sends the rest through the tunnel; inbound control payloads get a
//! minimal IP header rebuilt before injection so the stack sees complete
//! packets.

use super::ControlError;
use crate::session::TunnelOutbound;
use crate::stack::{decap_ipv4, encap_ipv4, NetStack, StackError};
use crate::CONTROL_SESSION;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

pub struct StackBridge {
    stack: Arc<dyn NetStack>,
    local: Ipv4Addr,
    peer: Ipv4Addr,
}

impl StackBridge {
    pub fn new(stack: Arc<dyn NetStack>, local: Ipv4Addr, peer: Ipv4Addr) -> Self {
        Self { stack, local, peer }
    }

    /// Deliver one control-channel payload from the tunnel into the stack.
    pub async fn inject(&self, payload: &[u8]) -> Result<(), ControlError> {
        let pkt = encap_ipv4(self.peer, self.local, payload);
        self.stack.inject_inbound(&pkt).await?;
        Ok(())
    }

    /// Start the pump that forwards the stack's outbound packets through
    /// the tunnel. Runs until cancellation or a fatal send error.
    pub fn spawn_outbound(
        &self,
        outbound: Arc<dyn TunnelOutbound>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let stack = self.stack.clone();
        tokio::spawn(async move {
            loop {
                let pkt = tokio::select! {
                    _ = cancel.cancelled() => return,
                    pkt = stack.dequeue_outbound() => match pkt {
                        Ok(pkt) => pkt,
                        Err(StackError::Closed) => return,
                        Err(e) => {
                            warn!(error = %e, "stack dequeue failed");
                            return;
                        }
                    },
                };
                let payload = match decap_ipv4(&pkt) {
                    Ok(payload) => payload,
                    Err(e) => {
                        // The stack emitted something we cannot carry;
                        // drop it, the stack will retransmit.
                        warn!(error = %e, "unroutable stack packet");
                        continue;
                    }
                };
                trace!(len = payload.len(), "control payload outbound");
                if let Err(e) = outbound.send_session(CONTROL_SESSION, payload).await {
                    warn!(error = %e, "control outbound send failed");
                    return;
                }
            }
        })
    }
}
