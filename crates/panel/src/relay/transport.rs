//! Relay transports
//!
//! One host connection is served at a time. Each inbound line runs as its own
//! task; the session lock orders the resulting device operations.

use crate::panel::Panel;
use crate::relay::handle_line;
use anyhow::{Context, Result};
use clap::ValueEnum;
use common::DeviceBackend;
use protocol::{DeviceResponse, OutboundMessage, ProtocolError, read_line_async, write_line_async};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel used to talk to the host process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayTransport {
    /// Newline-delimited JSON on stdin/stdout
    #[default]
    Stdio,
    /// Newline-delimited JSON over a TCP connection
    Tcp,
    /// No host process
    None,
}

impl fmt::Display for RelayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Tcp => "tcp",
            Self::None => "none",
        })
    }
}

pub async fn serve_stdio<B: DeviceBackend>(
    panel: Panel<B>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Relay listening on stdio");
    serve_connection(
        panel,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await
}

pub async fn serve_tcp<B: DeviceBackend>(
    panel: Panel<B>,
    listen: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind relay listener on {}", listen))?;
    info!("Relay listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Relay accept failed: {}", e);
                    continue;
                }
            },
        };

        info!("Relay host connected from {}", peer);
        let (reader, writer) = stream.into_split();
        if let Err(e) = serve_connection(
            panel.clone(),
            BufReader::new(reader),
            writer,
            shutdown.child_token(),
        )
        .await
        {
            warn!("Relay connection from {} ended with error: {:#}", peer, e);
        }
        info!("Relay host {} disconnected", peer);
    }

    Ok(())
}

/// Serve one host connection
///
/// Returns when the peer closes its side or `shutdown` fires. Responses to
/// commands still in flight are written before returning.
pub async fn serve_connection<B, R, W>(
    panel: Panel<B>,
    mut reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    B: DeviceBackend,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let notifications = panel.subscribe();
    let writer_stop = CancellationToken::new();
    let writer_task = tokio::spawn(write_notifications(
        notifications,
        writer,
        writer_stop.clone(),
    ));

    let mut commands = JoinSet::new();
    let result = loop {
        reap_finished(&mut commands);
        let line = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            line = read_line_async(&mut reader) => line,
        };

        match line {
            Ok(Some(line)) => {
                let panel = panel.clone();
                commands.spawn(async move { handle_line(&panel, &line).await });
            }
            Ok(None) => {
                debug!("Relay peer closed its side");
                break Ok(());
            }
            Err(ProtocolError::Io(e)) => {
                break Err(anyhow::Error::new(e).context("Relay read failed"));
            }
            Err(e) => panel.log().error(format!("Invalid relay message: {}", e)),
        }
    };

    while let Some(done) = commands.join_next().await {
        if let Err(e) = done {
            warn!("Relay command task failed: {}", e);
        }
    }
    writer_stop.cancel();
    if let Err(e) = writer_task.await {
        warn!("Relay writer task failed: {}", e);
    }
    result
}

/// Drop the results of command tasks that already finished
fn reap_finished(commands: &mut JoinSet<()>) {
    while let Some(done) = commands.try_join_next() {
        if let Err(e) = done {
            warn!("Relay command task failed: {}", e);
        }
    }
}

async fn write_notifications<W>(
    mut notifications: broadcast::Receiver<OutboundMessage>,
    mut writer: W,
    stop: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        // Pending notifications are flushed before honouring stop
        let message = tokio::select! {
            biased;
            message = notifications.recv() => message,
            _ = stop.cancelled() => break,
        };

        match message {
            Ok(message) => {
                if let Err(e) = write_message(&mut writer, &message).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Relay fell behind, dropped {} notifications", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Write one message, replacing an unencodable response with an error
///
/// Only I/O failures are returned; the connection is unusable after one.
async fn write_message<W>(writer: &mut W, message: &OutboundMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let e = match write_line_async(writer, message).await {
        Ok(()) => return Ok(()),
        Err(ProtocolError::Io(e)) => return Err(e),
        Err(e) => e,
    };

    warn!("Cannot encode {}: {}", message.event_name(), e);
    if !matches!(message, OutboundMessage::DeviceResponse(_)) {
        return Ok(());
    }
    let reply = OutboundMessage::DeviceResponse(DeviceResponse::Error(e.to_string()));
    match write_line_async(writer, &reply).await {
        Err(ProtocolError::Io(e)) => Err(e),
        Err(e) => {
            warn!("Cannot encode error response: {}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
