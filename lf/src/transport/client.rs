//! Slave-side connection: registration handshake, split reader/writer,
//! and reconnect backoff

use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use flowkit::domain::SlaveInfo;

use super::error::TransportError;
use super::frame::{read_frame, write_frame};
use super::messages::{Envelope, Message};

/// Exponential backoff with jitter for reconnect attempts
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    next: Duration,
    max: Duration,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            next: initial,
            max,
            attempts: 0,
            max_attempts,
        }
    }

    /// Next delay, or `None` once the attempt budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(limit) = self.max_attempts
            && self.attempts >= limit
        {
            return None;
        }
        self.attempts += 1;
        let jitter = rand::rng().random_range(0.8..1.2);
        let delay = self.next.mul_f64(jitter);
        self.next = (self.next * 2).min(self.max);
        Some(delay.min(self.max))
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempts = 0;
    }
}

/// An established, registered connection to the master
///
/// Outbound messages are queued on `outbound` (the writer task assigns
/// sequence numbers); inbound messages arrive on `inbound` in FIFO order.
/// A closed `inbound` means the connection died.
#[derive(Debug)]
pub struct Connection {
    pub assigned_id: String,
    pub outbound: mpsc::Sender<Message>,
    pub inbound: mpsc::Receiver<Message>,
}

impl Connection {
    /// Connect, register, and split into pump tasks
    pub async fn connect(addr: &str, info: &SlaveInfo, timeout: Duration) -> Result<Connection, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        // handshake: register, await the ack
        write_frame(
            &mut write_half,
            &Envelope {
                seq: 0,
                message: Message::Register(info.clone()),
            },
        )
        .await?;
        let ack = tokio::time::timeout(timeout, read_frame(&mut read_half))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let assigned_id = match ack.message {
            Message::RegisterAck {
                accepted: true,
                assigned_id,
                ..
            } => assigned_id.unwrap_or_else(|| info.id.clone()),
            Message::RegisterAck { reason, .. } => {
                return Err(TransportError::Rejected {
                    reason: reason.unwrap_or_else(|| "unspecified".to_string()),
                });
            }
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected register-ack, got {}",
                    other.kind()
                )));
            }
        };
        debug!(%assigned_id, %addr, "registered with master");

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let (in_tx, in_rx) = mpsc::channel::<Message>(256);

        // writer pump: assigns sequence numbers
        tokio::spawn(async move {
            let mut seq: u64 = 1;
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &Envelope { seq, message }).await {
                    warn!(error = %e, "writer pump stopped");
                    break;
                }
                seq += 1;
            }
        });

        // reader pump: closes `inbound` when the socket dies
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(envelope) => {
                        if in_tx.send(envelope.message).await.is_err() {
                            break;
                        }
                    }
                    Err(TransportError::ConnectionClosed) => break,
                    Err(e) => {
                        warn!(error = %e, "reader pump stopped");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            assigned_id,
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400), None);
        let first = backoff.next_delay().unwrap();
        assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        // capped at max (plus jitter slack)
        let capped = backoff.next_delay().unwrap();
        assert!(capped <= Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_attempt_budget() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(20), Some(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }
}
