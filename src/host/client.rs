//! Per-connection I/O: the handshake, then forwarding inbound commands
//! to the router and outbound frames from the router's queue onto the
//! wire. Holds no registry state itself; it only talks `Frame`s.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::protocol::{Command, Frame, FrameCodec};

use super::router::RouterMsg;

pub type ClientId = u64;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a client task reports back to the router.
pub enum ClientEvent {
    Connected { id: ClientId, outbound: mpsc::Sender<Frame> },
    Named { id: ClientId, name: String },
    Inbound { id: ClientId, command: Command },
    Disconnected { id: ClientId },
}

pub async fn run_client(
    id: ClientId,
    stream: UnixStream,
    router: mpsc::Sender<RouterMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    let send = |event: ClientEvent| {
        let router = router.clone();
        async move { router.send(RouterMsg::Client(event)).await }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(32);
    if send(ClientEvent::Connected { id, outbound: outbound_tx }).await.is_err() {
        return;
    }

    let mut framed = Framed::new(stream, FrameCodec::default());

    if framed.send(Frame::hello()).await.is_err() {
        let _ = send(ClientEvent::Disconnected { id }).await;
        return;
    }

    let name = match timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(frame))) => match frame.into_command() {
            Command::ClientHello(name) => name,
            _ => {
                let _ = framed.send(Frame::server_bye("expected hello")).await;
                let _ = send(ClientEvent::Disconnected { id }).await;
                return;
            }
        },
        _ => {
            let _ = framed.send(Frame::server_bye("handshake timeout")).await;
            let _ = send(ClientEvent::Disconnected { id }).await;
            return;
        }
    };
    if send(ClientEvent::Named { id, name }).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        let command = frame.into_command();
                        if send(ClientEvent::Inbound { id, command }).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) if framed.send(frame.clone()).await.is_ok() => {}
                    _ => break,
                }
            }
            _ = shutdown.changed() => {
                let _ = framed.send(Frame::server_bye("shutting down")).await;
                break;
            }
        }
    }

    let _ = send(ClientEvent::Disconnected { id }).await;
}
