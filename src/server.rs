//! Unix-socket server: accept loop, one thread per client, coordinated
//! shutdown.
//!
//! The listener thread only ever reports OS-level errors; anything that goes
//! wrong inside a single session is logged and kills that session alone.
//! [`ServerGuard`] is the owning handle: dropping it notifies the server
//! thread, which in turn notifies every client thread and joins them.

use std::fs::remove_file;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{sleep, Builder, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::exchange::Exchange;
use crate::session::Session;

struct Server {
    config: Arc<Config>,
    exchange: Arc<Exchange>,
    listener: UnixListener,
    client_num: u32,

    // One (join handle, close channel) pair per client thread.
    clients: Vec<(Option<JoinHandle<()>>, Sender<()>)>,
}

impl Server {
    fn new(config: Arc<Config>, exchange: Arc<Exchange>) -> Result<Self> {
        let path = Path::new(&config.socket_path);
        if path.exists() {
            remove_file(path)?;
        }

        info!(path = %config.socket_path, "creating unix socket");
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            config,
            exchange,
            listener,
            client_num: 0,
            clients: vec![],
        })
    }

    fn tick(&mut self) -> Result<()> {
        use std::io::ErrorKind::WouldBlock;

        match self.listener.accept() {
            Ok((stream, _)) => {
                let name = format!("client_{}", self.client_num);
                self.client_num += 1;
                let (sender, receiver) = channel();

                let config = self.config.clone();
                let exchange = self.exchange.clone();
                let handle = Builder::new()
                    .name(name)
                    .spawn(|| start_session(config, exchange, stream, receiver))?;

                self.clients.push((Some(handle), sender));
                Ok(())
            }
            Err(ref e) if e.kind() == WouldBlock => Ok(()),
            Err(e) => Err(e),
        }?;

        // Reap client threads that have already finished on their own.
        self.clients
            .retain(|(handle, _)| handle.as_ref().map_or(false, |h| !h.is_finished()));

        Ok(())
    }

    fn shutdown(&mut self) {
        for (handle, sender) in self.clients.iter_mut() {
            if let Err(e) = sender.send(()) {
                error!(error = %e, "couldn't send close to client thread");
                continue;
            }
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    error!("client thread panicked");
                }
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = remove_file(&self.config.socket_path) {
            error!(error = %e, "couldn't remove socket file");
        }
    }
}

/// Owning handle for the server thread. Dropping it shuts the whole server
/// down and joins every thread it spawned.
pub struct ServerGuard {
    handle: Option<JoinHandle<()>>,
    close_channel: Sender<()>,
}

impl ServerGuard {
    pub fn new(config: Arc<Config>, exchange: Arc<Exchange>) -> Result<Self> {
        let (sender, receiver) = channel();

        let handle = Builder::new()
            .name("server".to_string())
            .spawn(move || start_server(config, exchange, receiver))?;

        Ok(Self {
            handle: Some(handle),
            close_channel: sender,
        })
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if let Err(e) = self.close_channel.send(()) {
            error!(error = %e, "couldn't close server");
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("server thread panicked");
            }
        }
    }
}

fn start_server(config: Arc<Config>, exchange: Arc<Exchange>, closer: Receiver<()>) {
    // Accept-loop errors are OS-level; restart until told to close.
    loop {
        if let Err(e) = run_server(config.clone(), exchange.clone(), &closer) {
            error!(error = %e, "server crashed - restarting");
        } else {
            return;
        }

        match closer.try_recv() {
            Ok(_) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
    }
}

fn run_server(config: Arc<Config>, exchange: Arc<Exchange>, closer: &Receiver<()>) -> Result<()> {
    let mut server = Server::new(config, exchange)?;

    loop {
        match closer.try_recv() {
            Ok(_) => {
                // Stop accepting and wave the clients goodbye. Errors are
                // swallowed here so the restart loop above doesn't spin the
                // server back up mid-shutdown.
                server.shutdown();
                break;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        server.tick()?;

        // Throttle the accept loop.
        sleep(Duration::from_millis(50));
    }

    info!("shutdown complete");
    Ok(())
}

fn start_session(
    config: Arc<Config>,
    exchange: Arc<Exchange>,
    stream: UnixStream,
    closer: Receiver<()>,
) {
    info!("new session");
    if let Err(e) = run_session(config, exchange, stream, closer) {
        error!(error = %e, "session ended with error");
    }
}

fn run_session(
    config: Arc<Config>,
    exchange: Arc<Exchange>,
    stream: UnixStream,
    closer: Receiver<()>,
) -> Result<()> {
    let mut session = Session::new(config, exchange, stream);

    // The handshake is bounded by the hello timeout so a silent client
    // cannot park this thread forever.
    session.read_hello()?;
    session.write_hello()?;
    info!(session_id = %session.session_id(), "session established");

    loop {
        match closer.try_recv() {
            Ok(_) => {
                info!(session_id = %session.session_id(), "sending shutdown");
                session.shutdown()?;
                break;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        // tick_read returns false when the client initiated the shutdown;
        // tick_write errors once the client stops heartbeating.
        if !session.tick_read()? {
            break;
        }
        session.tick_write()?;

        sleep(Duration::from_millis(20));
    }

    info!(session_id = %session.session_id(), "session finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring;
    use crate::wire::{HEADER_LEN, VERSION};
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    static SOCKET_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_config() -> Arc<Config> {
        let n = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
        Arc::new(Config {
            socket_path: format!("/tmp/framecast-test-{}-{}.sock", std::process::id(), n),
            frame_width: 8,
            frame_height: 8,
            ..Config::default()
        })
    }

    fn request_header(msg_type: u8, msg_len: u32, msg_id: u32) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = VERSION;
        raw[1] = msg_type;
        raw[2..6].copy_from_slice(&msg_len.to_le_bytes());
        raw[6..10].copy_from_slice(&msg_id.to_le_bytes());
        raw
    }

    fn connect(path: &str) -> UnixStream {
        // The accept loop polls every 50ms; give the listener time to
        // appear and the backlog to drain.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    return stream;
                }
                Err(_) if Instant::now() < deadline => sleep(Duration::from_millis(20)),
                Err(e) => panic!("couldn't connect to {path}: {e}"),
            }
        }
    }

    fn read_response(stream: &mut UnixStream) -> (u8, serde_json::Value) {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        (header[1], serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn end_to_end_session_over_the_socket() {
        let config = test_config();
        let (mut tx, rx) = ring::channel(config.frame_size());
        let exchange = Arc::new(Exchange::new(rx).unwrap());
        let guard = ServerGuard::new(config.clone(), exchange).unwrap();

        let mut client = connect(&config.socket_path);

        // Hello handshake.
        client.write_all(&request_header(b'A', 0, 1)).unwrap();
        let (msg_type, body) = read_response(&mut client);
        assert_eq!(msg_type, b'a');
        assert_eq!(body["config"]["frameWidth"], 8);
        let session_id = body["sessionId"].as_str().unwrap();
        assert_eq!(session_id.len(), 8);

        // Subscribe to the stats feed and feed the ring so the worker has
        // something to chew on.
        let req = br#"{"updateInterval":10}"#;
        client
            .write_all(&request_header(b'S', req.len() as u32, 2))
            .unwrap();
        client.write_all(req).unwrap();
        tx.send(&vec![42u8; config.frame_size()], 7).unwrap();

        let (msg_type, stats) = read_response(&mut client);
        assert_eq!(msg_type, b's');
        assert!(stats.get("mean").is_some());

        // Client-initiated shutdown: keep reading feed frames until the
        // shutdown acknowledgment comes through.
        client.write_all(&request_header(b'Z', 0, 3)).unwrap();
        let mut acknowledged = false;
        for _ in 0..200 {
            let (msg_type, _) = read_response(&mut client);
            if msg_type == b'z' {
                acknowledged = true;
                break;
            }
        }
        assert!(acknowledged, "client shutdown must be acknowledged");

        drop(guard);
        assert!(
            !Path::new(&config.socket_path).exists(),
            "socket file must be removed on shutdown"
        );
    }

    #[test]
    fn server_shutdown_notifies_connected_clients() {
        let config = test_config();
        let (_tx, rx) = ring::channel(config.frame_size());
        let exchange = Arc::new(Exchange::new(rx).unwrap());
        let guard = ServerGuard::new(config.clone(), exchange).unwrap();

        let mut client = connect(&config.socket_path);
        client.write_all(&request_header(b'A', 0, 1)).unwrap();
        let (msg_type, _) = read_response(&mut client);
        assert_eq!(msg_type, b'a');

        // Dropping the guard walks shutdown through server and session
        // threads; the client hears about it on the wire.
        drop(guard);
        let (msg_type, _) = read_response(&mut client);
        assert_eq!(msg_type, b'z');
    }

    #[test]
    fn hello_timeout_reaps_silent_clients() {
        let config = test_config();
        let (_tx, rx) = ring::channel(config.frame_size());
        let exchange = Arc::new(Exchange::new(rx).unwrap());
        let _guard = ServerGuard::new(config.clone(), exchange).unwrap();

        let mut client = connect(&config.socket_path);

        // Say nothing: the hello timeout closes the stream on the server
        // side within client_hello_timeout seconds.
        let mut buf = [0u8; 1];
        match client.read(&mut buf) {
            Ok(0) => {}
            Ok(_) => panic!("server should not send data to a silent client"),
            Err(e) => panic!("expected clean close, got {e}"),
        }
    }
}
