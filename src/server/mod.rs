
pub mod compact;
pub mod config;
pub mod probe;
pub mod relay;

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{self, Duration, Instant};

use self::compact::CompactHandler;
use self::config::ServerConfig;
use self::relay::{RelayAction, RelayHandler};
use crate::error::*;
use crate::presence::ClientHandle;
use crate::proto::relay::{Frame, FrameHeader, FRAME_HEADER_LEN};

// Largest datagram the loop reads off either UDP socket.
const MAX_DATAGRAM: usize = 65_536;

const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// `Server` owns the rendezvous sockets and the single task that runs the
/// whole state machine. Drop it or call [`Server::close`] to stop.
pub struct Server {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Server {
    /// Binds TCP and UDP on the main port (plus the optional probe UDP
    /// port) and spawns the event loop. Bind failures are fatal and
    /// surface here.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let udp = UdpSocket::bind(("0.0.0.0", config.port)).await?;
        let tcp = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let probe = if config.probe_port != 0 {
            Some(UdpSocket::bind(("0.0.0.0", config.probe_port)).await?)
        } else {
            None
        };

        let udp_addr = udp.local_addr()?;
        let tcp_addr = tcp.local_addr()?;
        log::info!(
            "rendezvous server on udp/tcp {} (probe port {})",
            udp_addr,
            config.probe_port
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_handle = tokio::spawn(run(config, udp, tcp, probe, shutdown_rx));

        Ok(Server {
            udp_addr,
            tcp_addr,
            shutdown_tx,
            loop_handle: Some(loop_handle),
        })
    }

    pub fn udp_local_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_local_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Stops the event loop and releases every socket.
    pub async fn close(&mut self) -> Result<()> {
        let Some(handle) = self.loop_handle.take() else {
            return Err(Error::ErrClosed);
        };
        let _ = self.shutdown_tx.send(true);
        let _ = handle.await;
        Ok(())
    }
}

/// A live relay connection: where to write, and how to stop its reader.
struct ClientConn {
    writer: OwnedWriteHalf,
    reader: AbortHandle,
}

enum RelayEvent {
    Frame(ClientHandle, Frame),
    Closed(ClientHandle),
}

/// The event loop. Every piece of mutable server state lives in this one
/// task; reader tasks only move bytes into `event_rx`.
async fn run(
    config: ServerConfig,
    udp: UdpSocket,
    tcp: TcpListener,
    probe: Option<UdpSocket>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut compact_handler = CompactHandler::new(&config);
    let mut relay_handler = RelayHandler::new(&config);

    let mut conns: HashMap<ClientHandle, ClientConn> = HashMap::new();
    let mut readers = JoinSet::new();
    let (event_tx, mut event_rx) = mpsc::channel::<RelayEvent>(64);

    let mut udp_buf = vec![0u8; MAX_DATAGRAM];
    let mut probe_buf = vec![0u8; MAX_DATAGRAM];

    let mut retransmit = time::interval(RETRANSMIT_INTERVAL);
    let mut cleanup = time::interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped Server counts as a shutdown request too.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            result = udp.recv_from(&mut udp_buf) => match result {
                Ok((n, src)) => {
                    let out = compact_handler.handle_packet(Instant::now(), src, &udp_buf[..n]);
                    send_datagrams(&udp, out).await;
                }
                Err(err) => log::warn!("udp recv: {err}"),
            },

            result = async {
                match probe.as_ref() {
                    Some(p) => p.recv_from(&mut probe_buf).await,
                    None => std::future::pending().await,
                }
            } => match result {
                Ok((n, src)) => {
                    if let Some(reply) = probe::handle_probe(src, &probe_buf[..n]) {
                        if let Some(p) = probe.as_ref() {
                            if let Err(err) = p.send_to(&reply, src).await {
                                log::warn!("probe send to {src}: {err}");
                            }
                        }
                    }
                }
                Err(err) => log::warn!("probe recv: {err}"),
            },

            result = tcp.accept() => match result {
                Ok((stream, peer)) => match relay_handler.on_accept(Instant::now()) {
                    Ok(handle) => {
                        let (read_half, writer) = stream.into_split();
                        let reader = readers.spawn(read_frames(handle, read_half, event_tx.clone()));
                        conns.insert(handle, ClientConn { writer, reader });
                    }
                    Err(err) => {
                        log::warn!("refusing connection from {peer}: {err}");
                    }
                },
                Err(err) => log::warn!("tcp accept: {err}"),
            },

            Some(event) = event_rx.recv() => match event {
                RelayEvent::Frame(handle, frame) => {
                    let actions = relay_handler.on_frame(Instant::now(), handle, &frame);
                    apply_actions(&mut relay_handler, &mut conns, actions).await;
                }
                RelayEvent::Closed(handle) => {
                    relay_handler.on_disconnect(handle);
                    drop_conn(&mut conns, handle);
                }
            },

            _ = retransmit.tick(), if compact_handler.has_pending() => {
                let out = compact_handler.retransmit_pass(Instant::now());
                send_datagrams(&udp, out).await;
            }

            _ = cleanup.tick() => {
                let now = Instant::now();
                send_datagrams(&udp, compact_handler.cleanup(now)).await;
                for handle in relay_handler.cleanup(now) {
                    drop_conn(&mut conns, handle);
                }
            }
        }
    }

    // Shutdown: stop every reader, then let the sockets drop.
    readers.shutdown().await;
    conns.clear();
    log::info!("rendezvous server stopped");
}

async fn send_datagrams(udp: &UdpSocket, out: Vec<(SocketAddr, Vec<u8>)>) {
    for (dest, packet) in out {
        if let Err(err) = udp.send_to(&packet, dest).await {
            log::warn!("udp send to {dest}: {err}");
        }
    }
}

/// Closes a client's socket halves: the writer by drop, the reader by
/// abort.
fn drop_conn(conns: &mut HashMap<ClientHandle, ClientConn>, handle: ClientHandle) {
    if let Some(conn) = conns.remove(&handle) {
        conn.reader.abort();
    }
}

async fn apply_actions(
    relay_handler: &mut RelayHandler,
    conns: &mut HashMap<ClientHandle, ClientConn>,
    actions: Vec<RelayAction>,
) {
    for action in actions {
        match action {
            RelayAction::Send(handle, bytes) => {
                let Some(conn) = conns.get_mut(&handle) else {
                    continue;
                };
                if let Err(err) = conn.writer.write_all(&bytes).await {
                    log::debug!("write to {handle} failed: {err}");
                    relay_handler.on_disconnect(handle);
                    drop_conn(conns, handle);
                }
            }
            RelayAction::Close(handle) => {
                relay_handler.on_disconnect(handle);
                drop_conn(conns, handle);
            }
        }
    }
}

/// Per-connection reader: accumulates exactly one framed message at a
/// time with `read_exact`, so short reads never tear a frame. Any framing
/// violation or EOF reports the connection closed.
async fn read_frames(
    handle: ClientHandle,
    mut read_half: OwnedReadHalf,
    event_tx: mpsc::Sender<RelayEvent>,
) {
    let mut header = [0u8; FRAME_HEADER_LEN];

    loop {
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let fh = match FrameHeader::decode(&header) {
            Ok(fh) => fh,
            Err(err) => {
                log::debug!("closing {handle}: {err}");
                break;
            }
        };

        let mut body = vec![0u8; fh.length as usize];
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }

        if event_tx
            .send(RelayEvent::Frame(handle, Frame::new(fh.opcode, body)))
            .await
            .is_err()
        {
            return;
        }
    }

    let _ = event_tx.send(RelayEvent::Closed(handle)).await;
}
