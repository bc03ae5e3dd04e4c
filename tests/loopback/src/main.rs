fn main() {
    println!("Run `cargo test -p loopback` to execute the OTA loopback tests.");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use pixelflash_block_stream::{BlockStreamServer, ReceivedSession, ReceiverBehavior};
    use pixelflash_engine::{
        Destination, Engine, EngineConfig, ErrorKind, Payload, PayloadLayout, TransferPhase,
        VerificationTier,
    };
    use pixelflash_transfer::digest_bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Starts an OTA receiver on an ephemeral port.
    async fn receiver(
        behavior: ReceiverBehavior,
    ) -> (SocketAddr, mpsc::Receiver<ReceivedSession>, CancellationToken) {
        let cancel = CancellationToken::new();
        let server = BlockStreamServer::bind("127.0.0.1:0", behavior, cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move { server.serve(tx).await });
        (addr, rx, cancel)
    }

    /// Answers every HTTP request with the digest of the next completed
    /// OTA session, the way the device reports what it flashed.
    async fn hash_endpoint(mut sessions: mpsc::Receiver<ReceivedSession>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut tmp).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                }

                let session = loop {
                    match sessions.recv().await {
                        Some(s) if s.complete => break Some(s),
                        Some(_) => continue,
                        None => break None,
                    }
                };
                let body = match session {
                    Some(s) => serde_json::json!({
                        "status": "success",
                        "file": "/firmware.bin",
                        "size": s.data.len(),
                        "hash": s.digest().to_hex().to_uppercase(),
                    })
                    .to_string(),
                    None => r#"{"status":"error"}"#.to_string(),
                };
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        port
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_backoff_ms: 0,
            ack_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            probe_timeout_ms: 2_000,
            ..EngineConfig::default()
        }
    }

    fn firmware(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn drain(rx: &mut mpsc::Receiver<ReceivedSession>) -> Vec<ReceivedSession> {
        let mut out = Vec::new();
        while let Ok(session) = rx.try_recv() {
            out.push(session);
        }
        out
    }

    #[tokio::test]
    async fn stream_without_hash_endpoint_is_local_only() {
        let (addr, mut sessions, cancel) = receiver(ReceiverBehavior::default()).await;
        let engine = Engine::new(config()).unwrap();
        let data = firmware(5000);

        let result = engine
            .transfer(
                Payload::from_bytes("firmware.bin", data.clone()),
                Destination::raw_ota("127.0.0.1").with_port(addr.port()),
                true,
                PayloadLayout::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, TransferPhase::CompletedUnverified);
        assert_eq!(result.tier(), Some(VerificationTier::LocalOnly));
        assert_eq!(result.bytes_sent, 5000);

        let session = sessions.recv().await.unwrap();
        assert!(session.complete);
        assert_eq!(session.data, data);
        assert_eq!(session.header.total_size, 5000);
        assert_eq!(session.header.block_count, 5);
        assert_eq!(&session.header.digest, digest_bytes(&data).as_bytes());
        assert!(session.block_lengths.iter().all(|len| *len == 1024));
        cancel.cancel();
    }

    #[tokio::test]
    async fn stream_verified_through_hash_endpoint() {
        let (addr, sessions, cancel) = receiver(ReceiverBehavior::default()).await;
        let query_port = hash_endpoint(sessions).await;
        let engine = Engine::new(config()).unwrap();
        let data = firmware(3 * 1024 + 17);

        let result = engine
            .transfer(
                Payload::from_bytes("firmware.bin", data.clone()),
                Destination::raw_ota("127.0.0.1")
                    .with_port(addr.port())
                    .with_query_port(query_port),
                true,
                PayloadLayout::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, TransferPhase::Verified);
        let verification = result.verification.unwrap();
        assert_eq!(verification.tier, VerificationTier::Verified);
        assert_eq!(verification.local_digest, digest_bytes(&data));
        assert_eq!(verification.remote_size, Some(data.len() as u64));
        cancel.cancel();
    }

    #[tokio::test]
    async fn withheld_header_ack_fails_without_sending_blocks() {
        let behavior = ReceiverBehavior {
            withhold_header_ack: true,
            ..ReceiverBehavior::default()
        };
        let (addr, mut sessions, cancel) = receiver(behavior).await;
        let engine = Engine::new(EngineConfig {
            ack_timeout_ms: 200,
            ..config()
        })
        .unwrap();

        let result = engine
            .transfer(
                Payload::from_bytes("firmware.bin", firmware(4096)),
                Destination::raw_ota("127.0.0.1").with_port(addr.port()),
                true,
                PayloadLayout::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, TransferPhase::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::Transport);
        assert!(failure.message.contains("3 attempt"));
        assert_eq!(result.bytes_sent, 0);
        assert!(engine.active_session().is_none());

        // The receiver reports a session once the sender hangs up.
        let mut seen = Vec::new();
        while seen.len() < 3 {
            seen.push(sessions.recv().await.unwrap());
        }
        assert!(seen.iter().all(|s| s.blocks_received == 0 && !s.complete));
        cancel.cancel();
    }

    #[tokio::test]
    async fn rejected_block_restarts_stream_from_header() {
        let behavior = ReceiverBehavior {
            nak_block: Some(1),
            nak_sessions: 1,
            ..ReceiverBehavior::default()
        };
        let (addr, mut sessions, cancel) = receiver(behavior).await;
        let engine = Engine::new(config()).unwrap();
        let data = firmware(2500);

        let result = engine
            .transfer(
                Payload::from_bytes("firmware.bin", data.clone()),
                Destination::raw_ota("127.0.0.1").with_port(addr.port()),
                false,
                PayloadLayout::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, TransferPhase::CompletedUnverified);
        assert!(result.verification.is_none());

        let first = sessions.recv().await.unwrap();
        let second = sessions.recv().await.unwrap();
        assert!(!first.complete);
        assert_eq!(first.blocks_received, 1);
        assert!(second.complete);
        assert_eq!(second.data, data);
        assert!(drain(&mut sessions).is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let engine = Engine::new(config()).unwrap();

        let result = engine
            .transfer(
                Payload::from_bytes("firmware.bin", firmware(10)),
                Destination::raw_ota("127.0.0.1").with_port(port),
                true,
                PayloadLayout::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, TransferPhase::Failed);
        assert_eq!(result.failure.unwrap().kind, ErrorKind::Unreachable);
        assert!(result.local_digest.is_none());
    }
}
