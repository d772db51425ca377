//! TCP listener - framed stream telemetry
//!
//! Binary ports carry fixed 20-byte frames; whatever tail is buffered
//! when the peer disconnects is flushed as a final short reading.
//! UTF-8 ports are newline-delimited with a hard cap per line so a
//! peer that never sends a newline cannot grow the buffer forever.

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::actors::messages::Envelope;
use crate::actors::updater::UpdaterHandle;
use crate::config::{Encoding, PortConfig};
use crate::parser::{self, FRAME_LEN};

use super::{emit, Backoff};

/// Longest undelimited UTF-8 line accepted before it is force-flushed.
const MAX_LINE: usize = 4096;

const READ_BUFFER: usize = 2048;

pub fn spawn(
    bind_addr: String,
    config: PortConfig,
    updater: UpdaterHandle,
    events: broadcast::Sender<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(run(bind_addr, config, updater, events))
}

#[instrument(skip_all, fields(port = config.port))]
async fn run(
    bind_addr: String,
    config: PortConfig,
    updater: UpdaterHandle,
    events: broadcast::Sender<Envelope>,
) {
    let mut backoff = Backoff::new();

    loop {
        let listener = match TcpListener::bind((bind_addr.as_str(), config.port)).await {
            Ok(listener) => {
                backoff.reset();
                debug!("bound tcp listener");
                listener
            }
            Err(e) => {
                let delay = backoff.next();
                warn!("tcp bind failed: {e}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("connection from {peer}");
                    tokio::spawn(handle_connection(
                        stream,
                        config.clone(),
                        updater.clone(),
                        events.clone(),
                    ));
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!("tcp accept failed: {e}, rebinding in {delay:?}");
                    tokio::time::sleep(delay).await;
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    config: PortConfig,
    updater: UpdaterHandle,
    events: broadcast::Sender<Envelope>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; READ_BUFFER];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                drain(&mut pending, &config, &updater, &events).await;
            }
            Err(e) => {
                trace!("read error, dropping connection: {e}");
                break;
            }
        }
    }

    // Whatever is left when the peer hangs up is still a reading.
    if !pending.is_empty() {
        let reading = parser::parse(&pending, config.encoding);
        if !reading.text.is_empty() {
            emit(&config, reading, &updater, &events).await;
        }
    }
}

/// Emit every complete frame or line currently buffered.
async fn drain(
    pending: &mut Vec<u8>,
    config: &PortConfig,
    updater: &UpdaterHandle,
    events: &broadcast::Sender<Envelope>,
) {
    match config.encoding {
        Encoding::Binary => {
            while pending.len() >= FRAME_LEN {
                let frame: Vec<u8> = pending.drain(..FRAME_LEN).collect();
                let reading = parser::parse(&frame, Encoding::Binary);
                if !reading.text.is_empty() {
                    emit(config, reading, updater, events).await;
                }
            }
        }
        Encoding::Utf8 => {
            loop {
                if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let reading = parser::parse(&line, Encoding::Utf8);
                    if !reading.text.is_empty() {
                        emit(config, reading, updater, events).await;
                    }
                } else if pending.len() >= MAX_LINE {
                    let line: Vec<u8> = pending.drain(..MAX_LINE).collect();
                    let reading = parser::parse(&line, Encoding::Utf8);
                    if !reading.text.is_empty() {
                        emit(config, reading, updater, events).await;
                    }
                } else {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::messages::EventType;
    use crate::actors::siren::SirenHandle;
    use crate::alarms::AlarmManager;
    use crate::config::Protocol;
    use crate::storage::MemoryBackend;
    use crate::SystemKind;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn free_tcp_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    struct Fixture {
        port: u16,
        event_rx: broadcast::Receiver<Envelope>,
        _listener: JoinHandle<()>,
    }

    async fn listener(encoding: Encoding) -> Fixture {
        let port = free_tcp_port();
        let storage = Arc::new(MemoryBackend::new());
        let (events, event_rx) = broadcast::channel(64);
        let siren = SirenHandle::spawn(storage.clone(), events.clone());
        let alarms = AlarmManager::new(storage.clone(), events.clone(), siren);
        let updater = UpdaterHandle::spawn(storage.clone(), events.clone(), alarms);

        let config = PortConfig {
            port,
            protocol: Protocol::Tcp,
            label: "test".into(),
            kind: SystemKind::Equipment,
            encoding,
        };
        let listener = spawn("127.0.0.1".into(), config, updater, events);
        tokio::time::sleep(Duration::from_millis(50)).await;

        Fixture {
            port,
            event_rx,
            _listener: listener,
        }
    }

    async fn next_raw(rx: &mut broadcast::Receiver<Envelope>) -> String {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for raw event")
                .unwrap();
            if envelope.kind == EventType::Raw {
                return envelope.data["rawData"].as_str().unwrap().to_string();
            }
        }
    }

    #[tokio::test]
    async fn binary_stream_is_split_into_fixed_frames() {
        let mut f = listener(Encoding::Binary).await;

        let mut stream = TcpStream::connect(("127.0.0.1", f.port)).await.unwrap();
        // Two 20-byte frames in a single write.
        let mut payload = Vec::new();
        payload.extend_from_slice(b"FRAME-ONE-PAYLOAD-01");
        payload.extend_from_slice(b"FRAME-TWO-PAYLOAD-02");
        stream.write_all(&payload).await.unwrap();

        assert_eq!(next_raw(&mut f.event_rx).await, "FRAME-ONE-PAYLOAD-01");
        assert_eq!(next_raw(&mut f.event_rx).await, "FRAME-TWO-PAYLOAD-02");
    }

    #[tokio::test]
    async fn partial_frame_is_flushed_on_disconnect() {
        let mut f = listener(Encoding::Binary).await;

        let mut stream = TcpStream::connect(("127.0.0.1", f.port)).await.unwrap();
        stream.write_all(b"SHORT").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        assert_eq!(next_raw(&mut f.event_rx).await, "SHORT");
    }

    #[tokio::test]
    async fn frame_split_across_writes_is_reassembled() {
        let mut f = listener(Encoding::Binary).await;

        let mut stream = TcpStream::connect(("127.0.0.1", f.port)).await.unwrap();
        stream.write_all(b"FRAME-ONE-").await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"PAYLOAD-01").await.unwrap();

        assert_eq!(next_raw(&mut f.event_rx).await, "FRAME-ONE-PAYLOAD-01");
    }

    #[tokio::test]
    async fn utf8_stream_is_split_on_newlines() {
        let mut f = listener(Encoding::Utf8).await;

        let mut stream = TcpStream::connect(("127.0.0.1", f.port)).await.unwrap();
        stream.write_all(b"OK 100%\nFAULT LINE 3\n").await.unwrap();

        assert_eq!(next_raw(&mut f.event_rx).await, "OK 100%");
        assert_eq!(next_raw(&mut f.event_rx).await, "FAULT LINE 3");
    }
}
