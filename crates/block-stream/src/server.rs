//! Loopback OTA receiver (device side).
//!
//! Emulates the device's OTA listener: one session at a time, ACK per
//! frame, reassembly of `total_size` logical bytes. Behaviour switches let
//! tests reproduce a device that stalls or rejects a block.

use std::net::SocketAddr;

use pixelflash_transfer::{Digest, digest_bytes};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BlockStreamError;
use crate::wire::{
    ACK, COMMAND_FLASH, NAK, SESSION_HEADER_LEN, SessionHeader, read_block_header, write_ack,
};

/// Fault injection for the receiver.
#[derive(Debug, Clone, Default)]
pub struct ReceiverBehavior {
    /// Never acknowledge the session header.
    pub withhold_header_ack: bool,
    /// Reject this block index with a NAK.
    pub nak_block: Option<u32>,
    /// Number of sessions the NAK applies to. 0 means every session.
    pub nak_sessions: u32,
}

/// What the receiver saw during one session.
#[derive(Debug, Clone)]
pub struct ReceivedSession {
    pub header: SessionHeader,
    pub blocks_received: u32,
    /// On-wire length of each accepted block, padding included.
    pub block_lengths: Vec<u32>,
    /// Logical bytes, padding stripped.
    pub data: Vec<u8>,
    pub complete: bool,
}

impl ReceivedSession {
    /// SHA-256 of the reassembled bytes.
    pub fn digest(&self) -> Digest {
        digest_bytes(&self.data)
    }
}

/// Loopback OTA receiver.
pub struct BlockStreamServer {
    listener: TcpListener,
    behavior: ReceiverBehavior,
    cancel: CancellationToken,
}

impl BlockStreamServer {
    /// Binds the receiver. Use port 0 for an ephemeral port.
    pub async fn bind(
        addr: &str,
        behavior: ReceiverBehavior,
        cancel: CancellationToken,
    ) -> Result<Self, BlockStreamError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "OTA receiver bound");
        Ok(Self {
            listener,
            behavior,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BlockStreamError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections one at a time until cancelled, reporting every
    /// session on `sessions`. Connections that close without sending
    /// anything (reachability probes) are not reported.
    pub async fn serve(
        &self,
        sessions: mpsc::Sender<ReceivedSession>,
    ) -> Result<(), BlockStreamError> {
        let mut session_no: u32 = 0;
        loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.listener.accept() => result?,
            };

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.handle(stream, session_no) => result,
            };

            match outcome {
                Ok(None) => debug!(%addr, "probe connection"),
                Ok(Some(session)) => {
                    session_no += 1;
                    info!(
                        %addr,
                        blocks = session.blocks_received,
                        bytes = session.data.len(),
                        complete = session.complete,
                        "OTA session finished"
                    );
                    if sessions.send(session).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => warn!(%addr, error = %e, "OTA session error"),
            }
        }
    }

    fn should_nak(&self, session_no: u32, index: u32) -> bool {
        self.behavior.nak_block == Some(index)
            && (self.behavior.nak_sessions == 0 || session_no < self.behavior.nak_sessions)
    }

    async fn handle(
        &self,
        stream: TcpStream,
        session_no: u32,
    ) -> Result<Option<ReceivedSession>, BlockStreamError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut raw = [0u8; SESSION_HEADER_LEN];
        if reader.read(&mut raw[..1]).await? == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut raw[1..]).await?;
        let header = SessionHeader::decode(&raw);

        if header.command != COMMAND_FLASH {
            write_ack(&mut writer, NAK).await?;
            return Err(BlockStreamError::Protocol(format!(
                "unknown command 0x{:02x}",
                header.command
            )));
        }

        let mut session = ReceivedSession {
            header: header.clone(),
            blocks_received: 0,
            block_lengths: Vec::new(),
            data: Vec::with_capacity(header.total_size as usize),
            complete: false,
        };

        if self.behavior.withhold_header_ack {
            // Stall until the sender gives up.
            let mut sink = Vec::new();
            reader.read_to_end(&mut sink).await?;
            return Ok(Some(session));
        }
        write_ack(&mut writer, ACK).await?;

        let mut buf = vec![0u8; header.block_size as usize];
        for expected in 0..header.block_count {
            let Some(block) = read_block_header(&mut reader).await? else {
                break;
            };
            if block.index != expected || block.length > header.block_size {
                warn!(
                    expected,
                    index = block.index,
                    length = block.length,
                    "unexpected block frame"
                );
                write_ack(&mut writer, NAK).await?;
                break;
            }

            let frame = &mut buf[..block.length as usize];
            reader.read_exact(frame).await?;

            if self.should_nak(session_no, block.index) {
                write_ack(&mut writer, NAK).await?;
                break;
            }

            let remaining = header.total_size as usize - session.data.len();
            let logical = frame.len().min(remaining);
            session.data.extend_from_slice(&frame[..logical]);
            session.blocks_received += 1;
            session.block_lengths.push(block.length);
            write_ack(&mut writer, ACK).await?;
        }

        session.complete = session.blocks_received == header.block_count
            && session.data.len() == header.total_size as usize;
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{SessionHeader, read_ack, write_block, write_session_header};
    use crate::error::AckStage;
    use tokio::io::AsyncWriteExt;

    async fn start(
        behavior: ReceiverBehavior,
    ) -> (SocketAddr, mpsc::Receiver<ReceivedSession>, CancellationToken) {
        let cancel = CancellationToken::new();
        let server = BlockStreamServer::bind("127.0.0.1:0", behavior, cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move { server.serve(tx).await });
        (addr, rx, cancel)
    }

    #[tokio::test]
    async fn probe_connections_are_not_sessions() {
        let (addr, mut rx, cancel) = start(ReceiverBehavior::default()).await;

        // Probe: connect and close.
        drop(TcpStream::connect(addr).await.unwrap());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = SessionHeader {
            command: COMMAND_FLASH,
            total_size: 3,
            digest: *digest_bytes(b"xyz").as_bytes(),
            block_size: 4,
            block_count: 1,
        };
        write_session_header(&mut stream, &header).await.unwrap();
        read_ack(&mut stream, AckStage::Header).await.unwrap();
        write_block(&mut stream, 0, b"xyz\xFF").await.unwrap();
        read_ack(&mut stream, AckStage::Block(0)).await.unwrap();
        stream.shutdown().await.unwrap();

        let session = rx.recv().await.unwrap();
        assert!(session.complete);
        assert_eq!(session.data, b"xyz");
        assert_eq!(session.digest(), digest_bytes(b"xyz"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn rejects_unknown_command() {
        let (addr, _rx, cancel) = start(ReceiverBehavior::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = SessionHeader {
            command: 0x09,
            total_size: 1,
            digest: [0; 32],
            block_size: 4,
            block_count: 1,
        };
        write_session_header(&mut stream, &header).await.unwrap();
        assert!(matches!(
            read_ack(&mut stream, AckStage::Header).await,
            Err(BlockStreamError::Nak { byte: NAK, .. })
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn nak_limited_to_first_sessions() {
        let behavior = ReceiverBehavior {
            nak_block: Some(0),
            nak_sessions: 1,
            ..ReceiverBehavior::default()
        };
        let (addr, mut rx, cancel) = start(behavior).await;
        let header = SessionHeader {
            command: COMMAND_FLASH,
            total_size: 2,
            digest: *digest_bytes(b"ok").as_bytes(),
            block_size: 2,
            block_count: 1,
        };

        for attempt in 0..2 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_session_header(&mut stream, &header).await.unwrap();
            read_ack(&mut stream, AckStage::Header).await.unwrap();
            write_block(&mut stream, 0, b"ok").await.unwrap();
            let ack = read_ack(&mut stream, AckStage::Block(0)).await;
            assert_eq!(ack.is_ok(), attempt == 1);
            drop(stream);

            let session = rx.recv().await.unwrap();
            assert_eq!(session.complete, attempt == 1);
        }
        cancel.cancel();
    }
}
