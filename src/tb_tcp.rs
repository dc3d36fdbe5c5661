//! TCP Side Channel
//!
//! A throwaway server that hands the raw file bytes to every client that
//! connects, used as a baseline transfer time next to the protocol under
//! test. Wire format: a 10-byte decimal size header right-padded with `:`,
//! then the bytes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::tb_error::NodeError;

pub const SIZE_HEADER_LEN: usize = 10;

pub fn size_header(size: u64) -> io::Result<Vec<u8>> {
    let mut header = size.to_string().into_bytes();
    if header.len() > SIZE_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("file size {} does not fit the size header", size),
        ));
    }
    header.resize(SIZE_HEADER_LEN, b':');
    Ok(header)
}

fn parse_size_header(header: &[u8]) -> Result<u64, NodeError> {
    std::str::from_utf8(header)
        .ok()
        .map(|s| s.trim_matches(':'))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad size header").into())
}

pub struct TcpFileServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TcpFileServer {
    /// Bind an ephemeral port on `ip` and start serving `data`
    pub async fn spawn(ip: &str, data: Arc<Vec<u8>>) -> io::Result<Self> {
        let listener = TcpListener::bind((ip, 0)).await?;
        let addr = listener.local_addr()?;
        log::info!("TCP server listening at {}", addr);

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut senders = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let data = data.clone();
                            senders.spawn(async move {
                                match send_file(stream, &data).await {
                                    Ok(()) => log::debug!("Sent {} bytes to {}", data.len(), peer),
                                    Err(e) => log::warn!("Failed sending file to {}: {}", peer, e),
                                }
                            });
                        }
                        Err(e) => log::warn!("Accept error: {}", e),
                    },
                }
            }
            // in-flight transfers finish before close returns
            while senders.join_next().await.is_some() {}
        });

        Ok(Self { addr, shutdown, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn close(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            log::warn!("TCP server task ended abnormally: {}", e);
        }
        log::info!("Closed TCP server {}", self.addr);
    }
}

async fn send_file(mut stream: TcpStream, data: &[u8]) -> io::Result<()> {
    stream.write_all(&size_header(data.len() as u64)?).await?;
    stream.write_all(data).await?;
    stream.shutdown().await
}

/// Fetch the whole file from `addr`, returning the byte count
pub async fn fetch_file_tcp(addr: &str) -> Result<u64, NodeError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| NodeError::Unreachable(format!("{}: {}", addr, e)))?;

    let mut header = [0u8; SIZE_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let expected = parse_size_header(&header)?;

    let got = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
    if got != expected {
        return Err(NodeError::SizeMismatch { expected, got });
    }
    Ok(got)
}
