//! Daemon connection — TCP client with automatic reconnect.
//!
//! Incoming broadcasts become [`AppMessage`]s; outgoing [`Command`]s are
//! drained from an mpsc so the UI never blocks on the socket.

use std::time::Duration;

use onda_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppMessage;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub async fn run(
    address: String,
    tx: mpsc::Sender<AppMessage>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    loop {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                info!("Connected to daemon at {}", address);
                if tx.send(AppMessage::Connected(true)).await.is_err() {
                    return;
                }
                if let Err(e) = drive(stream, &tx, &mut cmd_rx).await {
                    debug!("Daemon connection dropped: {}", e);
                }
                if tx.send(AppMessage::Connected(false)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Cannot reach daemon at {}: {}", address, e);
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn drive(
    stream: TcpStream,
    tx: &mpsc::Sender<AppMessage>,
    cmd_rx: &mut mpsc::Receiver<Command>,
) -> anyhow::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                let n = result?;
                if n == 0 {
                    anyhow::bail!("daemon closed the connection");
                }
                read_buf.extend_from_slice(&tmp[..n]);

                loop {
                    if read_buf.len() < 4 { break; }
                    match Message::decode(&read_buf) {
                        Ok((msg, consumed)) => {
                            read_buf.drain(..consumed);
                            dispatch(msg, tx).await?;
                        }
                        Err(_) => break, // incomplete frame
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    anyhow::bail!("command channel closed");
                };
                let encoded = Message::Command(cmd).encode()?;
                write_half.write_all(&encoded).await?;
            }
        }
    }
}

async fn dispatch(msg: Message, tx: &mpsc::Sender<AppMessage>) -> anyhow::Result<()> {
    match msg {
        Message::Broadcast(Broadcast::Hello {
            protocol_version,
            state,
            ..
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                warn!(
                    "Daemon speaks protocol v{}, this client expects v{}",
                    protocol_version, PROTOCOL_VERSION
                );
            }
            tx.send(AppMessage::StateUpdated(state)).await?;
        }
        Message::Broadcast(Broadcast::State { data }) => {
            tx.send(AppMessage::StateUpdated(data)).await?;
        }
        Message::Broadcast(Broadcast::Log { message }) => {
            tx.send(AppMessage::LogLine(message)).await?;
        }
        Message::Command(_) => {
            // Clients never receive commands; ignore.
        }
    }
    Ok(())
}
