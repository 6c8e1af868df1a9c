//! TCP listener for the command protocol.
//!
//! The first line of every connection must be the shared secret. A wrong
//! secret gets `AUTHENTICATION FAILED` and the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::{dispatch, Command, AUTHENTICATED, AUTHENTICATION_FAILED, INVALID_COMMAND};
use crate::error::{CollectorError, Result};
use crate::orchestrator::Orchestrator;

pub struct CommandServer {
    listener: TcpListener,
    secret: Arc<String>,
    orchestrator: Arc<Orchestrator>,
}

impl CommandServer {
    /// # Errors
    ///
    /// Returns `Io` if the address cannot be bound
    pub async fn bind(addr: &str, secret: &str, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Command server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            secret: Arc::new(secret.to_string()),
            orchestrator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the future is dropped
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    let secret = self.secret.clone();
                    let orchestrator = self.orchestrator.clone();

                    tokio::spawn(async move {
                        match handle_client(socket, addr, &secret, &orchestrator).await {
                            Ok(()) => debug!("Client {} disconnected", addr),
                            Err(CollectorError::AuthenticationFailed) => {
                                warn!("Client {} failed authentication", addr)
                            }
                            Err(e) => warn!("Client {} error: {}", addr, e),
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    secret: &str,
    orchestrator: &Orchestrator,
) -> Result<()> {
    info!("Client connected: {}", addr);
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    if first.trim_end_matches('\r') != secret {
        writer.write_all(format!("{}\n", AUTHENTICATION_FAILED).as_bytes()).await?;
        writer.shutdown().await?;
        return Err(CollectorError::AuthenticationFailed);
    }
    writer.write_all(format!("{}\n", AUTHENTICATED).as_bytes()).await?;

    while let Some(line) = lines.next_line().await? {
        let request = line.trim();
        if request.is_empty() {
            continue;
        }

        let reply = match Command::parse(request) {
            Some(command) => dispatch(orchestrator, command).await,
            None => {
                debug!("Invalid command from {}: {}", addr, request);
                INVALID_COMMAND.to_string()
            }
        };
        writer.write_all(format!("{}\n", reply).as_bytes()).await?;
    }

    Ok(())
}
