//! Background listener accepting and negotiating incoming associations.
//!
//! One worker task owns the session acceptor. Each incoming session is
//! negotiated synchronously with the configured allowed syntaxes; an
//! established association is handed to consumers through a FIFO queue,
//! a failed one is aborted and reported through the event channel, never
//! silently dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::association::ServerAssociation;
use crate::channel::DimseChannel;
use crate::codec::Codec;
use crate::config::DimseConfig;
use crate::error::{DimseError, Result};
use crate::transport::SessionAcceptor;

/// Extra wait granted to the worker beyond one poll interval on close
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Notifications emitted by the listener worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEvent {
    /// Peer label of the failed session
    pub peer: String,
    /// Why negotiation failed
    pub error: String,
}

/// Accepts incoming sessions in the background and queues established
/// associations
pub struct AssociationListener {
    queue: mpsc::Receiver<ServerAssociation>,
    events: mpsc::Receiver<ListenerEvent>,
    closing: watch::Sender<bool>,
    handle: JoinHandle<()>,
    poll_interval: Duration,
}

impl AssociationListener {
    /// Validate the configuration and start the listener worker
    pub fn spawn(
        config: DimseConfig,
        acceptor: Box<dyn SessionAcceptor>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        config.validate()?;
        let poll_interval = config.poll_interval();
        let (queue_tx, queue_rx) = mpsc::channel(config.max_associations.max(1) as usize);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (closing_tx, closing_rx) = watch::channel(false);

        info!(aet = %config.local_aet, port = config.port, "starting association listener");
        let handle = tokio::spawn(run(config, acceptor, codec, queue_tx, event_tx, closing_rx));

        Ok(Self {
            queue: queue_rx,
            events: event_rx,
            closing: closing_tx,
            handle,
            poll_interval,
        })
    }

    /// Wait up to `timeout` for the next established association.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub async fn take(&mut self, timeout: Duration) -> Result<Option<ServerAssociation>> {
        match tokio::time::timeout(timeout, self.queue.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(association)) => Ok(Some(association)),
            Ok(None) => Err(DimseError::listener("listener worker stopped")),
        }
    }

    /// Drain one queued failure notification, if any
    pub fn try_event(&mut self) -> Option<ListenerEvent> {
        self.events.try_recv().ok()
    }

    /// Stop the worker, waiting one poll interval plus a fixed grace before
    /// forcing termination, then release the listening handle
    pub async fn close(mut self) {
        let _ = self.closing.send(true);
        let grace = self.poll_interval + CLOSE_GRACE;
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            warn!("listener worker did not stop in time; terminating it");
            self.handle.abort();
            let _ = self.handle.await;
        }
        info!("association listener closed");
    }
}

async fn run(
    config: DimseConfig,
    mut acceptor: Box<dyn SessionAcceptor>,
    codec: Arc<dyn Codec>,
    queue: mpsc::Sender<ServerAssociation>,
    events: mpsc::Sender<ListenerEvent>,
    mut closing: watch::Receiver<bool>,
) {
    let poll_interval = config.poll_interval();
    loop {
        if *closing.borrow() {
            break;
        }
        match acceptor.accept(poll_interval).await {
            // Nothing pending; poll again
            Ok(None) => continue,
            Ok(Some(link)) => {
                let peer = link.peer().to_string();
                debug!(peer = %peer, "incoming session");

                let params = match config.acceptor_params() {
                    Ok(params) => params,
                    Err(e) => {
                        error!("listener misconfigured: {}", e);
                        break;
                    }
                };
                let mut association = ServerAssociation::new(link, params, codec.clone());
                match negotiate(&mut association, &config).await {
                    Ok(accepted) => {
                        debug!(peer = %peer, accepted, "queueing established association");
                        tokio::select! {
                            result = queue.send(association) => {
                                if result.is_err() {
                                    // Consumers are gone
                                    break;
                                }
                            }
                            _ = closing.changed() => break,
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, "negotiation failed: {}", e);
                        association.abort().await;
                        let _ = events
                            .send(ListenerEvent {
                                peer,
                                error: e.to_string(),
                            })
                            .await;
                    }
                }
            }
            Err(e) => {
                error!("session acceptor failed: {}", e);
                let _ = events
                    .send(ListenerEvent {
                        peer: String::new(),
                        error: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

async fn negotiate(association: &mut ServerAssociation, config: &DimseConfig) -> Result<usize> {
    let proposed = association
        .receive_proposal(config.read_timeout())
        .await?
        .is_some();
    if !proposed {
        return Err(DimseError::timeout("peer connected but never proposed"));
    }
    association
        .accept(
            &config.allowed_abstract_syntaxes,
            &config.allowed_transfer_syntaxes,
        )
        .await
}
