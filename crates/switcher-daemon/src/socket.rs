use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use switcher_proto::protocol::{Broadcast, Command, Message, SwitchSnapshot, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::store::StateStore;

/// Largest command frame body accepted from an observer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

fn frame_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

/// One attached observer.  Holds only the newest snapshot the client has not
/// written yet, so a slow client coalesces updates instead of queueing them.
pub struct ClientConnection {
    snapshot_tx: watch::Sender<SwitchSnapshot>,
}

impl ClientConnection {
    /// Offer a snapshot; older revisions never replace newer ones.
    fn offer(&self, snapshot: &SwitchSnapshot) {
        self.snapshot_tx.send_if_modified(|latest| {
            if snapshot.rev > latest.rev {
                *latest = snapshot.clone();
                true
            } else {
                false
            }
        });
    }
}

/// Registry of connected observers.  `notify_all` never blocks on a client.
#[derive(Clone, Default)]
pub struct Broadcaster {
    clients: Arc<Mutex<HashMap<u64, ClientConnection>>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<u64, ClientConnection>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Push `snapshot` to every connected observer, dropping entries whose
    /// client task has gone away.
    pub fn notify_all(&self, snapshot: &SwitchSnapshot) {
        self.clients().retain(|id, client| {
            if client.snapshot_tx.is_closed() {
                debug!("Client {} gone, removing", id);
                return false;
            }
            client.offer(snapshot);
            true
        });
    }

    /// Subscribe to `store` so every completed change is pushed to observers.
    pub async fn attach(&self, store: &StateStore) {
        let broadcaster = self.clone();
        store
            .on_change(move |state| broadcaster.notify_all(&state.snapshot()))
            .await;
    }

    fn register(&self, initial: SwitchSnapshot) -> (u64, watch::Receiver<SwitchSnapshot>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        self.clients().insert(id, ClientConnection { snapshot_tx });
        (id, snapshot_rx)
    }

    fn offer_to(&self, id: u64, snapshot: &SwitchSnapshot) {
        if let Some(client) = self.clients().get(&id) {
            client.offer(snapshot);
        }
    }

    fn unregister(&self, id: u64) -> usize {
        let mut clients = self.clients();
        clients.remove(&id);
        clients.len()
    }

    /// Drop every connection; client tasks notice their closed channel and exit.
    pub fn close_all(&self) {
        self.clients().clear();
    }
}

/// Everything a client task needs besides its socket.
#[derive(Clone)]
pub struct ServerContext {
    pub broadcaster: Broadcaster,
    pub store: Arc<StateStore>,
    pub command_tx: mpsc::Sender<Command>,
    pub log_tx: broadcast::Sender<String>,
    pub write_timeout: Duration,
}

/// Bind the observer socket and spawn the accept loop.  The loop exits and
/// closes every connection once `stop` flips to true.
pub async fn start_server(
    bind_address: &str,
    port: u16,
    ctx: ServerContext,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!("TCP server listening at {}", local_addr);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Register before the second read so a change landing
                        // in between is either read here or pushed to us.
                        let initial = ctx.store.snapshot().await;
                        let (id, snapshot_rx) = ctx.broadcaster.register(initial);
                        ctx.broadcaster.offer_to(id, &ctx.store.snapshot().await);

                        info!(
                            "Client {} connected from {} ({} connected)",
                            id,
                            peer,
                            ctx.broadcaster.client_count()
                        );

                        let ctx = ctx.clone();
                        let stop = stop.clone();
                        tokio::spawn(async move {
                            handle_client(stream, id, snapshot_rx, &ctx, stop).await;
                            let remaining = ctx.broadcaster.unregister(id);
                            info!("Client {} disconnected ({} connected)", id, remaining);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        ctx.broadcaster.close_all();
        info!("TCP server stopped");
    });

    Ok((local_addr, handle))
}

async fn write_message<W>(writer: &mut W, message: Message, timeout: Duration) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = message.encode()?;
    tokio::time::timeout(timeout, writer.write_all(&encoded))
        .await
        .map_err(|_| anyhow::anyhow!("write timed out after {:?}", timeout))??;
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    client_id: u64,
    mut snapshot_rx: watch::Receiver<SwitchSnapshot>,
    ctx: &ServerContext,
    mut stop: watch::Receiver<bool>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut log_rx = ctx.log_tx.subscribe();
    let mut logs_open = true;
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();
    let timeout = ctx.write_timeout;

    // Send Hello with current state snapshot on connect
    let hello = snapshot_rx.borrow_and_update().clone();
    let hello = Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state: hello,
    });
    if let Err(e) = write_message(&mut write_half, hello, timeout).await {
        warn!("Client {}: hello failed: {}", client_id, e);
        return;
    }

    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
            }

            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    // Broadcaster dropped us (shutdown).
                    break;
                }
                let data = snapshot_rx.borrow_and_update().clone();
                let msg = Message::Broadcast(Broadcast::State { data });
                if let Err(e) = write_message(&mut write_half, msg, timeout).await {
                    warn!("Client {}: {}", client_id, e);
                    break;
                }
            }

            log = log_rx.recv(), if logs_open => match log {
                Ok(message) => {
                    let msg = Message::Broadcast(Broadcast::Log { message });
                    if write_message(&mut write_half, msg, timeout).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Client {} missed {} log messages", client_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    logs_open = false;
                }
            },

            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            let len = frame_len(&read_buf);
                            if len > MAX_FRAME_LEN {
                                warn!("Client {} announced a {} byte frame, dropping", client_id, len);
                                let msg = Message::Broadcast(Broadcast::Error {
                                    message: format!("frame too large: {} > {} bytes", len, MAX_FRAME_LEN),
                                });
                                let _ = write_message(&mut write_half, msg, timeout).await;
                                return;
                            }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(Command::GetState), consumed)) => {
                                    read_buf.drain(..consumed);
                                    let data = ctx.store.snapshot().await;
                                    let msg = Message::Broadcast(Broadcast::State { data });
                                    if write_message(&mut write_half, msg, timeout).await.is_err() {
                                        return;
                                    }
                                }
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    if ctx.command_tx.send(cmd).await.is_err() {
                                        warn!("Engine command channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    if read_buf.len() < 4 + len {
                                        // Partial frame, wait for more
                                        break;
                                    }
                                    read_buf.drain(..4 + len);
                                    warn!("Client {} sent an invalid frame: {}", client_id, e);
                                    let msg = Message::Broadcast(Broadcast::Error {
                                        message: format!("invalid message: {}", e),
                                    });
                                    if write_message(&mut write_half, msg, timeout).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    struct Server {
        addr: SocketAddr,
        broadcaster: Broadcaster,
        store: Arc<StateStore>,
        command_rx: mpsc::Receiver<Command>,
        log_tx: broadcast::Sender<String>,
        stop_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn server() -> Server {
        let store = StateStore::shared(true);
        let broadcaster = Broadcaster::new();
        broadcaster.attach(&store).await;
        let (command_tx, command_rx) = mpsc::channel(8);
        let (log_tx, _) = broadcast::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = ServerContext {
            broadcaster: broadcaster.clone(),
            store: store.clone(),
            command_tx,
            log_tx: log_tx.clone(),
            write_timeout: Duration::from_secs(2),
        };
        let (addr, handle) = start_server("127.0.0.1", 0, ctx, stop_rx).await.unwrap();
        Server {
            addr,
            broadcaster,
            store,
            command_rx,
            log_tx,
            stop_tx,
            handle,
        }
    }

    async fn read_message(stream: &mut TcpStream) -> Message {
        let fut = async {
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await.unwrap();
            let len = u32::from_be_bytes(header) as usize;
            let mut frame = header.to_vec();
            frame.resize(4 + len, 0);
            stream.read_exact(&mut frame[4..]).await.unwrap();
            Message::decode(&frame).unwrap().0
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("no message from server")
    }

    async fn read_state(stream: &mut TcpStream) -> SwitchSnapshot {
        loop {
            match read_message(stream).await {
                Message::Broadcast(Broadcast::State { data }) => return data,
                Message::Broadcast(Broadcast::Log { .. }) => continue,
                other => panic!("expected state, got {:?}", other),
            }
        }
    }

    async fn read_hello(stream: &mut TcpStream) -> SwitchSnapshot {
        match read_message(stream).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                state
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    async fn wait_for_clients(broadcaster: &Broadcaster, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broadcaster.client_count() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count never settled");
    }

    #[tokio::test]
    async fn test_hello_matches_store_at_connect() {
        let srv = server().await;
        srv.store.set_detected(96000.0, true).await;

        let mut client = TcpStream::connect(srv.addr).await.unwrap();
        let hello = read_hello(&mut client).await;
        assert_eq!(hello, srv.store.snapshot().await);
        assert_eq!(hello.detected_sample_rate_khz, Some(96.0));
    }

    #[tokio::test]
    async fn test_changes_reach_every_client() {
        let srv = server().await;
        let mut a = TcpStream::connect(srv.addr).await.unwrap();
        let mut b = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut a).await;
        read_hello(&mut b).await;
        wait_for_clients(&srv.broadcaster, 2).await;

        let state = srv.store.set_detected(48000.0, false).await;
        assert_eq!(read_state(&mut a).await.rev, state.rev);
        assert_eq!(read_state(&mut b).await.rev, state.rev);
    }

    #[tokio::test]
    async fn test_disconnect_is_isolated() {
        let srv = server().await;
        let mut stays = TcpStream::connect(srv.addr).await.unwrap();
        let mut leaves = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut stays).await;
        read_hello(&mut leaves).await;
        wait_for_clients(&srv.broadcaster, 2).await;

        drop(leaves);
        wait_for_clients(&srv.broadcaster, 1).await;

        srv.store.set_detected(88200.0, false).await;
        assert_eq!(read_state(&mut stays).await.detected_sample_rate_khz, Some(88.2));
    }

    #[tokio::test]
    async fn test_idle_client_does_not_hold_up_others() {
        let srv = server().await;
        // Never reads past the hello.
        let _idle = TcpStream::connect(srv.addr).await.unwrap();
        let mut active = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut active).await;
        wait_for_clients(&srv.broadcaster, 2).await;

        let mut last = 0;
        for i in 0..200u32 {
            last = srv.store.set_detected(40000.0 + i as f64, false).await.rev;
        }
        // The active client may skip intermediate states but ends on the newest.
        let mut seen = read_state(&mut active).await.rev;
        while seen < last {
            let next = read_state(&mut active).await.rev;
            assert!(next > seen);
            seen = next;
        }
        assert_eq!(seen, last);
    }

    #[tokio::test]
    async fn test_get_state_and_commands() {
        let mut srv = server().await;
        let mut client = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut client).await;

        let get = Message::Command(Command::GetState).encode().unwrap();
        client.write_all(&get).await.unwrap();
        assert_eq!(read_state(&mut client).await, srv.store.snapshot().await);

        let toggle = Message::Command(Command::SetAutoSwitch { enabled: false })
            .encode()
            .unwrap();
        let apply = Message::Command(Command::ApplyDetected).encode().unwrap();
        // Two frames in one write are both decoded.
        client.write_all(&[toggle, apply].concat()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), srv.command_rx.recv())
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), srv.command_rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(Command::SetAutoSwitch { enabled: false }));
        assert_eq!(second, Some(Command::ApplyDetected));
    }

    #[tokio::test]
    async fn test_invalid_frame_gets_error_reply() {
        let srv = server().await;
        let mut client = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut client).await;

        let body = br#"{"cmd":"Reboot"}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        frame.extend(Message::Command(Command::GetState).encode().unwrap());
        client.write_all(&frame).await.unwrap();

        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Error { message }) => {
                assert!(message.starts_with("invalid message"))
            }
            other => panic!("expected error, got {:?}", other),
        }
        // The connection survives and the next frame is still served.
        assert_eq!(read_state(&mut client).await, srv.store.snapshot().await);
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_client() {
        let srv = server().await;
        let mut stays = TcpStream::connect(srv.addr).await.unwrap();
        let mut client = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut stays).await;
        read_hello(&mut client).await;
        wait_for_clients(&srv.broadcaster, 2).await;

        // Rejected on the header alone, before any body arrives.
        client.write_all(&0xFFFF_FFF0u32.to_be_bytes()).await.unwrap();

        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Error { message }) => {
                assert!(message.starts_with("frame too large"))
            }
            other => panic!("expected error, got {:?}", other),
        }
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        wait_for_clients(&srv.broadcaster, 1).await;

        // The other observer is unaffected.
        srv.store.set_detected(96000.0, false).await;
        assert_eq!(read_state(&mut stays).await.detected_sample_rate_khz, Some(96.0));
    }

    #[tokio::test]
    async fn test_logs_are_forwarded() {
        let srv = server().await;
        let mut client = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut client).await;
        // The log subscription is taken before the hello is written.
        srv.log_tx.send("12:00:00 [WARN] device busy".to_string()).unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Log { message }) => {
                assert!(message.contains("device busy"))
            }
            other => panic!("expected log, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let srv = server().await;
        let mut client = TcpStream::connect(srv.addr).await.unwrap();
        read_hello(&mut client).await;

        srv.stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), srv.handle)
            .await
            .expect("accept loop did not stop")
            .unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(srv.broadcaster.client_count(), 0);
    }

    #[test]
    fn test_offer_never_regresses() {
        let broadcaster = Broadcaster::new();
        let (id, rx) = broadcaster.register(SwitchSnapshot {
            rev: 5,
            ..Default::default()
        });
        broadcaster.offer_to(
            id,
            &SwitchSnapshot {
                rev: 3,
                ..Default::default()
            },
        );
        assert_eq!(rx.borrow().rev, 5);
        broadcaster.notify_all(&SwitchSnapshot {
            rev: 6,
            ..Default::default()
        });
        assert_eq!(rx.borrow().rev, 6);

        drop(rx);
        broadcaster.notify_all(&SwitchSnapshot {
            rev: 7,
            ..Default::default()
        });
        assert_eq!(broadcaster.client_count(), 0);
    }
}
