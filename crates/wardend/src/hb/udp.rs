//! UDP heartbeat driver, unicast or multicast.
//!
//! The transmitter seals each outgoing payload, cuts it into datagrams and
//! writes every datagram to every destination. The receiver reassembles,
//! opens and forwards what it gets. Neither retries: a lost message shows up
//! as a liveness timeout in the peer controller.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::codec::{Fragment, Reassembler, fragment};
use super::crypto::Envelope;
use super::ctrl::{Direction, PeerCtrlHandle};
use super::{Inbound, Receiver, Transmitter};
use crate::config::HbDriverConfig;

/// What both sides of a driver share
#[derive(Clone)]
pub struct DriverContext {
    pub localhost: String,
    pub envelope: Arc<Envelope>,
    pub ctrl: PeerCtrlHandle,
    pub max_datagram_size: usize,
    pub max_fragments: usize,
    pub fragment_idle: Duration,
}

pub struct UdpTx {
    id: String,
    peers: Vec<String>,
    /// Nodes reported on the transmit stream after a successful send
    nodes: Vec<String>,
    ctx: DriverContext,
    outbound: broadcast::Sender<Vec<u8>>,
    cancel: Option<CancellationToken>,
}

impl UdpTx {
    pub fn new(
        cfg: &HbDriverConfig,
        nodes: Vec<String>,
        ctx: DriverContext,
        outbound: broadcast::Sender<Vec<u8>>,
    ) -> Self {
        let nodes = nodes.into_iter().filter(|n| *n != ctx.localhost).collect();
        Self {
            id: format!("{}.tx", cfg.name),
            peers: cfg.peers.clone(),
            nodes,
            ctx,
            outbound,
            cancel: None,
        }
    }
}

impl Transmitter for UdpTx {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, parent: &CancellationToken) -> anyhow::Result<()> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_loop_v4(false)?;
        let socket = UdpSocket::from_std(socket)?;

        let cancel = parent.child_token();
        self.cancel = Some(cancel.clone());
        let task = TxTask {
            id: self.id.clone(),
            peers: self.peers.clone(),
            nodes: self.nodes.clone(),
            ctx: self.ctx.clone(),
            socket,
        };
        let rx = self.outbound.subscribe();
        tokio::spawn(task.run(rx, cancel));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

struct TxTask {
    id: String,
    peers: Vec<String>,
    nodes: Vec<String>,
    ctx: DriverContext,
    socket: UdpSocket,
}

impl TxTask {
    async fn run(self, mut rx: broadcast::Receiver<Vec<u8>>, cancel: CancellationToken) {
        for node in &self.nodes {
            self.ctx.ctrl.register(node, &self.id, Direction::Tx).await;
        }
        tracing::info!(hb_id = %self.id, peers = ?self.peers, "heartbeat transmitter started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(payload) => self.send(&payload).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(hb_id = %self.id, skipped = n, "transmitter lagging, messages skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        self.ctx.ctrl.unregister(&self.id).await;
        tracing::info!(hb_id = %self.id, "heartbeat transmitter stopped");
    }

    async fn send(&self, payload: &[u8]) {
        let sealed = match self.ctx.envelope.seal(payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(hb_id = %self.id, error = %e, "failed to seal heartbeat");
                return;
            }
        };
        let fragments = match fragment(&sealed, self.ctx.max_datagram_size, self.ctx.max_fragments) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(hb_id = %self.id, len = sealed.len(), error = %e, "failed to fragment heartbeat");
                return;
            }
        };

        let mut failures = 0usize;
        for f in &fragments {
            let datagram = match f.encode() {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(hb_id = %self.id, error = %e, "failed to encode fragment");
                    return;
                }
            };
            let datagram = &datagram;
            let sends = self
                .peers
                .iter()
                .map(|peer| async move { (peer, self.socket.send_to(datagram, peer).await) });
            for (peer, res) in futures::future::join_all(sends).await {
                if let Err(e) = res {
                    failures += 1;
                    tracing::debug!(hb_id = %self.id, peer = %peer, error = %e, "heartbeat send failed");
                }
            }
        }

        if failures > 0 {
            tracing::warn!(hb_id = %self.id, failures, "heartbeat message partially sent");
            return;
        }
        for node in &self.nodes {
            self.ctx.ctrl.success(node, &self.id, Direction::Tx).await;
        }
    }
}

pub struct UdpRx {
    id: String,
    bind: String,
    multicast_interface: Option<Ipv4Addr>,
    /// Multicast group to join, taken from the destination list
    group: Option<Ipv4Addr>,
    ctx: DriverContext,
    inbound: mpsc::Sender<Inbound>,
    cancel: Option<CancellationToken>,
}

impl UdpRx {
    pub fn new(cfg: &HbDriverConfig, ctx: DriverContext, inbound: mpsc::Sender<Inbound>) -> Self {
        let group = cfg
            .peers
            .iter()
            .filter_map(|p| p.parse::<SocketAddr>().ok())
            .find_map(|addr| match addr.ip() {
                IpAddr::V4(ip) if ip.is_multicast() => Some(ip),
                _ => None,
            });
        Self {
            id: format!("{}.rx", cfg.name),
            bind: cfg.bind.clone(),
            multicast_interface: cfg.multicast_interface,
            group,
            ctx,
            inbound,
            cancel: None,
        }
    }

    fn bind(&self) -> anyhow::Result<UdpSocket> {
        let socket = std::net::UdpSocket::bind(&self.bind)?;
        if let Some(group) = self.group {
            let interface = self.multicast_interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &interface)?;
        }
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket)?)
    }
}

impl Receiver for UdpRx {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, parent: &CancellationToken) -> anyhow::Result<()> {
        let socket = self.bind()?;
        let cancel = parent.child_token();
        self.cancel = Some(cancel.clone());
        let task = RxTask {
            id: self.id.clone(),
            reassembler: Reassembler::new(self.ctx.fragment_idle, self.ctx.max_fragments),
            ctx: self.ctx.clone(),
            inbound: self.inbound.clone(),
        };
        tokio::spawn(task.run(socket, cancel));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

struct RxTask {
    id: String,
    reassembler: Reassembler,
    ctx: DriverContext,
    inbound: mpsc::Sender<Inbound>,
}

impl RxTask {
    async fn run(mut self, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.ctx.max_datagram_size.max(1500) + 512];
        let mut purge = tokio::time::interval(self.ctx.fragment_idle.max(Duration::from_millis(100)) / 2);
        tracing::info!(hb_id = %self.id, addr = ?socket.local_addr().ok(), "heartbeat receiver started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => self.handle_datagram(&buf[..len], addr).await,
                    Err(e) => tracing::warn!(hb_id = %self.id, error = %e, "heartbeat receive error"),
                },
                _ = purge.tick() => {
                    let purged = self.reassembler.purge(Instant::now());
                    if purged > 0 {
                        tracing::debug!(hb_id = %self.id, purged, pending = self.reassembler.pending(), "dropped incomplete messages");
                    }
                }
            }
        }

        self.ctx.ctrl.unregister(&self.id).await;
        tracing::info!(hb_id = %self.id, "heartbeat receiver stopped");
    }

    async fn handle_datagram(&mut self, datagram: &[u8], addr: SocketAddr) {
        let fragment = match Fragment::decode(datagram) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(hb_id = %self.id, addr = %addr, error = %e, "invalid heartbeat datagram");
                return;
            }
        };
        let Some(sealed) = self.reassembler.push(fragment, Instant::now()) else {
            return;
        };
        let (nodename, payload) = match self.ctx.envelope.open(&sealed) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::debug!(hb_id = %self.id, addr = %addr, error = %e, "heartbeat message rejected");
                return;
            }
        };
        if nodename == self.ctx.localhost {
            return;
        }

        self.ctx.ctrl.success(&nodename, &self.id, Direction::Rx).await;
        if self.inbound.send(Inbound { nodename, payload }).await.is_err() {
            tracing::debug!(hb_id = %self.id, "heartbeat manager is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hb::ctrl::CtrlCmd;

    fn ctx(localhost: &str, ctrl: PeerCtrlHandle) -> DriverContext {
        DriverContext {
            localhost: localhost.to_string(),
            envelope: Arc::new(Envelope::new("c1", localhost, "s3cret")),
            ctrl,
            max_datagram_size: 400,
            max_fragments: 4096,
            fragment_idle: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_loopback_exchange() {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let rx_addr = probe.local_addr().unwrap();
        drop(probe);

        let cancel = CancellationToken::new();

        let (ctrl_tx, mut ctrl_rx) = mpsc::channel(64);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let rx_cfg = HbDriverConfig {
            name: "hb#1".into(),
            bind: rx_addr.to_string(),
            peers: vec![],
            multicast_interface: None,
        };
        let mut rx = UdpRx::new(&rx_cfg, ctx("n2", PeerCtrlHandle::from_sender(ctrl_tx.clone())), inbound_tx);
        rx.start(&cancel).unwrap();

        let (outbound, _) = broadcast::channel(4);
        let tx_cfg = HbDriverConfig {
            name: "hb#1".into(),
            bind: "127.0.0.1:0".into(),
            peers: vec![rx_addr.to_string()],
            multicast_interface: None,
        };
        let mut tx = UdpTx::new(
            &tx_cfg,
            vec!["n1".into(), "n2".into()],
            ctx("n1", PeerCtrlHandle::from_sender(ctrl_tx)),
            outbound.clone(),
        );
        tx.start(&cancel).unwrap();

        // several fragments at this datagram size
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 200) as u8).collect();
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let _ = outbound.send(payload.clone());
                if let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), inbound_rx.recv()).await {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got.nodename, "n1");
        assert_eq!(got.payload, payload);

        // both sides reported success for the other node
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut seen = Vec::new();
        while let Ok(cmd) = ctrl_rx.try_recv() {
            if let CtrlCmd::Success { node, hb_id, .. } = cmd {
                seen.push((node, hb_id));
            }
        }
        assert!(seen.contains(&("n2".to_string(), "hb#1.tx".to_string())));
        assert!(seen.contains(&("n1".to_string(), "hb#1.rx".to_string())));

        tx.stop();
        rx.stop();
        cancel.cancel();
    }
}
