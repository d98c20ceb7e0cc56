//! Heartbeat subsystem.
//!
//! ```text
//! store tick --bytes--> [tx drivers] ~~udp~~> [rx drivers] --Inbound--> manager --HbMessage--> store
//!                             \                    /
//!                              success(node, hb_id)
//!                                     v
//!                              peer controller --HbStatusUpdated / HbModeUpdated--> bus
//! ```

pub mod codec;
pub mod crypto;
pub mod ctrl;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::HbConfig;
use crate::store::{HbMessage, StoreHandle};
use crypto::Envelope;
use ctrl::PeerCtrlHandle;
use udp::{DriverContext, UdpRx, UdpTx};

/// Sending half of a heartbeat driver
pub trait Transmitter: Send + Sync {
    fn id(&self) -> &str;

    /// Spawn the sending task under `parent`
    fn start(&mut self, parent: &CancellationToken) -> anyhow::Result<()>;

    fn stop(&mut self);
}

/// Receiving half of a heartbeat driver
pub trait Receiver: Send + Sync {
    fn id(&self) -> &str;

    /// Spawn the receiving task under `parent`
    fn start(&mut self, parent: &CancellationToken) -> anyhow::Result<()>;

    fn stop(&mut self);
}

/// A payload received and authenticated by a receiver
#[derive(Debug)]
pub struct Inbound {
    pub nodename: String,
    pub payload: Vec<u8>,
}

/// Owns the drivers and feeds decoded messages to the store
pub struct HbManager {
    txs: Vec<Box<dyn Transmitter>>,
    rxs: Vec<Box<dyn Receiver>>,
    inbound: mpsc::Receiver<Inbound>,
    store: StoreHandle,
}

impl HbManager {
    /// Build one UDP transmitter and receiver per configured driver
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &HbConfig,
        clustername: &str,
        secret: &str,
        localhost: &str,
        nodes: Vec<String>,
        ctrl: PeerCtrlHandle,
        store: StoreHandle,
        outbound: broadcast::Sender<Vec<u8>>,
    ) -> Self {
        let (inbound_tx, inbound) = mpsc::channel(64);
        let ctx = DriverContext {
            localhost: localhost.to_string(),
            envelope: Arc::new(Envelope::new(clustername, localhost, secret)),
            ctrl,
            max_datagram_size: config.max_datagram_size,
            max_fragments: config.max_fragments,
            fragment_idle: config.fragment_idle(),
        };

        let mut txs: Vec<Box<dyn Transmitter>> = Vec::new();
        let mut rxs: Vec<Box<dyn Receiver>> = Vec::new();
        for driver in &config.drivers {
            txs.push(Box::new(UdpTx::new(driver, nodes.clone(), ctx.clone(), outbound.clone())));
            rxs.push(Box::new(UdpRx::new(driver, ctx.clone(), inbound_tx.clone())));
        }
        Self {
            txs,
            rxs,
            inbound,
            store,
        }
    }

    /// Start every driver. A driver failing to start is logged and skipped.
    pub fn start(&mut self, cancel: &CancellationToken) -> usize {
        let mut started = 0;
        for rx in self.rxs.iter_mut() {
            match rx.start(cancel) {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(hb_id = %rx.id(), error = %e, "failed to start heartbeat receiver"),
            }
        }
        for tx in self.txs.iter_mut() {
            match tx.start(cancel) {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(hb_id = %tx.id(), error = %e, "failed to start heartbeat transmitter"),
            }
        }
        started
    }

    pub fn stop(&mut self) {
        for tx in self.txs.iter_mut() {
            tx.stop();
        }
        for rx in self.rxs.iter_mut() {
            rx.stop();
        }
    }

    /// Decode inbound payloads into the store until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let started = self.start(&cancel);
        tracing::info!(drivers = self.txs.len(), streams = started, "heartbeat started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.inbound.recv() => match msg {
                    Some(inbound) => deliver(&self.store, inbound).await,
                    None => break,
                },
            }
        }

        self.stop();
        let dropped = crate::bus::drop_pending(&mut self.inbound, Duration::from_millis(10)).await;
        tracing::info!(dropped, "heartbeat stopped");
    }
}

/// Decode one inbound payload and hand it to the store
async fn deliver(store: &StoreHandle, inbound: Inbound) {
    let msg: HbMessage = match serde_json::from_slice(&inbound.payload) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(node = %inbound.nodename, error = %e, "undecodable heartbeat message");
            return;
        }
    };
    if msg.nodename() != inbound.nodename {
        tracing::warn!(node = %inbound.nodename, claimed = %msg.nodename(), "heartbeat message node mismatch");
        return;
    }
    tracing::trace!(node = %inbound.nodename, kind = msg.kind(), generation = msg.generation(), "heartbeat message");
    if let Err(e) = store.apply_message(msg).await {
        tracing::debug!(error = %e, "store unavailable");
    }
}
