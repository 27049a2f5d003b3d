//! Master-side accept loop and per-slave connection handlers

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use flowkit::domain::{MetricsReport, SlaveInfo, SlaveStatus, TaskUpdate};

use super::error::TransportError;
use super::frame::{read_frame, write_frame};
use super::messages::{Envelope, Message};

/// Events surfaced to the master runtime by slave connections
#[derive(Debug)]
pub enum SlaveEvent {
    /// A slave registered; the runtime decides acceptance and replies with
    /// the assigned id (or a rejection reason) on `ack`.
    Connected {
        info: SlaveInfo,
        /// Fresh per-connection epoch; assignments from an older epoch are
        /// aborted when the slave reconnects
        epoch: String,
        outbound: mpsc::Sender<Message>,
        ack: oneshot::Sender<Result<String, String>>,
    },
    Disconnected {
        slave_id: String,
        epoch: String,
    },
    Heartbeat {
        slave_id: String,
        status: SlaveStatus,
    },
    Update(TaskUpdate),
    Metrics(MetricsReport),
}

/// Accept loop; one handler task per slave connection
pub async fn run_listener(listener: TcpListener, events: mpsc::Sender<SlaveEvent>) {
    info!(addr = ?listener.local_addr().ok(), "transport listening");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "slave connected");
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, events).await {
                        debug!(%peer, error = %e, "connection ended");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, events: mpsc::Sender<SlaveEvent>) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    // the first frame must be a registration
    let first = read_frame(&mut read_half).await?;
    let info = match first.message {
        Message::Register(info) => info,
        other => {
            return Err(TransportError::Protocol(format!(
                "expected register, got {}",
                other.kind()
            )));
        }
    };

    let epoch = uuid::Uuid::now_v7().to_string();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let (ack_tx, ack_rx) = oneshot::channel();
    events
        .send(SlaveEvent::Connected {
            info,
            epoch: epoch.clone(),
            outbound: out_tx,
            ack: ack_tx,
        })
        .await
        .map_err(|_| TransportError::ConnectionClosed)?;

    let slave_id = match ack_rx.await {
        Ok(Ok(assigned_id)) => {
            write_frame(
                &mut write_half,
                &Envelope {
                    seq: 0,
                    message: Message::RegisterAck {
                        accepted: true,
                        assigned_id: Some(assigned_id.clone()),
                        reason: None,
                    },
                },
            )
            .await?;
            assigned_id
        }
        Ok(Err(reason)) => {
            write_frame(
                &mut write_half,
                &Envelope {
                    seq: 0,
                    message: Message::RegisterAck {
                        accepted: false,
                        assigned_id: None,
                        reason: Some(reason.clone()),
                    },
                },
            )
            .await?;
            return Err(TransportError::Rejected { reason });
        }
        Err(_) => return Err(TransportError::ConnectionClosed),
    };

    // writer pump for assignments and commands
    let writer = tokio::spawn(async move {
        let mut seq: u64 = 1;
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &Envelope { seq, message }).await {
                warn!(error = %e, "slave writer pump stopped");
                break;
            }
            seq += 1;
        }
    });

    // reader loop: demultiplex slave → master streams
    let result = loop {
        match read_frame(&mut read_half).await {
            Ok(envelope) => {
                let event = match envelope.message {
                    Message::Heartbeat { slave_id, status } => SlaveEvent::Heartbeat { slave_id, status },
                    Message::Update(update) => SlaveEvent::Update(update),
                    Message::Metrics(report) => SlaveEvent::Metrics(report),
                    other => {
                        warn!(kind = other.kind(), "unexpected message from slave");
                        continue;
                    }
                };
                if events.send(event).await.is_err() {
                    break Ok(());
                }
            }
            Err(TransportError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    writer.abort();
    let _ = events
        .send(SlaveEvent::Disconnected {
            slave_id: slave_id.clone(),
            epoch,
        })
        .await;
    debug!(%slave_id, "slave disconnected");
    result
}
