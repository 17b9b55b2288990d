//! In-process transport backed by tokio channels.
//!
//! A [`LoopbackHub`] wires a connector half to an acceptor half the same way
//! two nodes would meet over a network. Used by the integration tests and by
//! embedded deployments that run both roles in one process.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, Pdu, SessionAcceptor, UpperLayer};
use crate::error::{DimseError, Result};

const LINK_BUFFER: usize = 64;

/// One end of an in-process session
pub struct LoopbackLink {
    tx: mpsc::Sender<Pdu>,
    rx: mpsc::Receiver<Pdu>,
    peer: String,
}

/// Create a connected pair of links
pub fn pair() -> (LoopbackLink, LoopbackLink) {
    let (a_tx, a_rx) = mpsc::channel(LINK_BUFFER);
    let (b_tx, b_rx) = mpsc::channel(LINK_BUFFER);
    (
        LoopbackLink {
            tx: a_tx,
            rx: b_rx,
            peer: "loopback:acceptor".to_string(),
        },
        LoopbackLink {
            tx: b_tx,
            rx: a_rx,
            peer: "loopback:initiator".to_string(),
        },
    )
}

#[async_trait]
impl UpperLayer for LoopbackLink {
    async fn send(&mut self, pdu: Pdu) -> Result<()> {
        self.tx
            .send(pdu)
            .await
            .map_err(|_| DimseError::Transport("peer closed the session".to_string()))
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Pdu>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(pdu)) => Ok(Some(pdu)),
            Ok(None) => Err(DimseError::Transport(
                "peer closed the session".to_string(),
            )),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Rendezvous point connecting initiators to one acceptor
pub struct LoopbackHub {
    tx: mpsc::Sender<LoopbackLink>,
    rx: Option<mpsc::Receiver<LoopbackLink>>,
}

impl LoopbackHub {
    /// Create a new hub
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        Self { tx, rx: Some(rx) }
    }

    /// Connector half for initiators; may be cloned freely
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            tx: self.tx.clone(),
        }
    }

    /// Acceptor half; can be taken once
    pub fn acceptor(&mut self) -> LoopbackAcceptor {
        LoopbackAcceptor {
            rx: self.rx.take().expect("acceptor already taken"),
        }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Initiator half of a [`LoopbackHub`]
#[derive(Clone)]
pub struct LoopbackConnector {
    tx: mpsc::Sender<LoopbackLink>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _timeout: Duration,
    ) -> Result<Box<dyn UpperLayer>> {
        let (initiator, mut acceptor) = pair();
        acceptor.peer = format!("{}:{}", host, port);
        self.tx
            .send(acceptor)
            .await
            .map_err(|_| DimseError::Transport(format!("no acceptor at {}:{}", host, port)))?;
        Ok(Box::new(initiator))
    }
}

/// Acceptor half of a [`LoopbackHub`]
pub struct LoopbackAcceptor {
    rx: mpsc::Receiver<LoopbackLink>,
}

#[async_trait]
impl SessionAcceptor for LoopbackAcceptor {
    async fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn UpperLayer>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(link)) => Ok(Some(Box::new(link))),
            Ok(None) => Err(DimseError::Transport("hub closed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut a, mut b) = pair();
        a.send(Pdu::ReleaseRq).await.unwrap();
        let received = b.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Some(Pdu::ReleaseRq));
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (_a, mut b) = pair();
        let received = b.receive(Duration::from_millis(20)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_closed_peer_is_an_error() {
        let (a, mut b) = pair();
        drop(a);
        let result = b.receive(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DimseError::Transport(_))));
    }

    #[tokio::test]
    async fn test_hub_connects_to_acceptor() {
        let mut hub = LoopbackHub::new();
        let connector = hub.connector();
        let mut acceptor = hub.acceptor();

        let dial = tokio::spawn(async move {
            connector
                .connect("localhost", 11112, Duration::from_secs(1))
                .await
        });

        let accepted = acceptor.accept(Duration::from_secs(1)).await.unwrap();
        assert!(accepted.is_some());
        dial.await.unwrap().unwrap();
    }
}
