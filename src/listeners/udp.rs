//! UDP listener - one datagram, one reading

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::actors::messages::Envelope;
use crate::actors::updater::UpdaterHandle;
use crate::config::PortConfig;
use crate::parser;

use super::{emit, Backoff};

const RECV_BUFFER: usize = 2048;

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
        let socket = match UdpSocket::bind((bind_addr.as_str(), config.port)).await {
            Ok(socket) => {
                backoff.reset();
                debug!("bound udp listener");
                socket
            }
            Err(e) => {
                let delay = backoff.next();
                warn!("udp bind failed: {e}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let mut buf = [0u8; RECV_BUFFER];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    trace!("{n} bytes from {peer}");
                    let reading = parser::parse(&buf[..n], config.encoding);
                    if reading.text.is_empty() {
                        continue;
                    }
                    emit(&config, reading, &updater, &events).await;
                }
                Err(e) => {
                    let delay = backoff.next();
                    warn!("udp recv failed: {e}, rebinding in {delay:?}");
                    tokio::time::sleep(delay).await;
                    break;
                }
            }
        }
    }
}
