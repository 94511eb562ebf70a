//! Per-client protocol session.
//!
//! A session is ticked by its own server thread: `tick_read` pumps the
//! non-blocking read side through the header/body state machine and
//! `tick_write` pushes due feed updates and enforces the heartbeat
//! deadline. Clients that stop heartbeating are shut down and reaped.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::conflate;
use crate::error::{Result, ServiceError};
use crate::exchange::Exchange;
use crate::wire::{self, Empty, FrameStats, Header, HelloResponse, Motion, MsgType, HEADER_LEN};

/// How long a client may stay silent before the session assumes it is dead.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Copy, Clone, PartialEq)]
enum ReadState {
    Header,
    Body,
}

pub struct Session {
    config: Arc<Config>,
    exchange: Arc<Exchange>,
    stream: UnixStream,
    last_read: Instant,

    // Feed subscriptions; clients attach and detach these at runtime.
    stats_receiver: Option<conflate::Receiver<FrameStats>>,
    stats_last_write: Instant,
    stats_interval: Duration,

    motion_receiver: Option<conflate::Receiver<Motion>>,
    motion_last_write: Instant,
    motion_interval: Duration,

    session_id: String,

    // Read state machine buffers.
    read_state: ReadState,
    read_header_buf: [u8; HEADER_LEN],
    read_bytes: usize,
    read_body_buf: Vec<u8>,
    pending: Option<Header>,

    write_buf: Vec<u8>,
}

impl Session {
    pub fn new(config: Arc<Config>, exchange: Arc<Exchange>, stream: UnixStream) -> Self {
        Self {
            config,
            exchange,
            stream,
            last_read: Instant::now(),
            stats_receiver: None,
            stats_last_write: Instant::now(),
            stats_interval: Duration::from_secs(1),
            motion_receiver: None,
            motion_last_write: Instant::now(),
            motion_interval: Duration::from_secs(1),
            session_id: String::new(),
            read_state: ReadState::Header,
            read_header_buf: [0; HEADER_LEN],
            read_bytes: 0,
            read_body_buf: Vec::with_capacity(1024),
            pending: None,
            write_buf: Vec::with_capacity(1024),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Blocks for the client hello, bounded by the configured timeout so a
    /// silent client cannot hang its thread.
    pub fn read_hello(&mut self) -> Result<()> {
        let t = Duration::from_secs(self.config.client_hello_timeout);
        self.stream.set_read_timeout(Some(t))?;
        self.stream.read_exact(&mut self.read_header_buf)?;

        let header = Header::decode(&self.read_header_buf)?;
        if header.msg_type != MsgType::Hello || header.msg_len != 0 {
            return Err(ServiceError::InvalidRequest);
        }

        self.last_read = Instant::now();
        self.session_id = format!("{:08x}", rand::random::<u32>());
        info!(
            session_id = %self.session_id,
            msg_id = header.msg_id,
            "received client hello"
        );
        Ok(())
    }

    pub fn write_hello(&mut self) -> Result<()> {
        let body = HelloResponse {
            config: (*self.config).clone(),
            session_id: self.session_id.clone(),
        };
        self.write_msg(MsgType::Hello, &body)?;
        self.write()
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.write_msg(MsgType::Shutdown, &Empty {})?;
        self.write()
    }

    /// Pumps the read side. Returns `Ok(false)` once the client has asked
    /// to shut the session down.
    pub fn tick_read(&mut self) -> Result<bool> {
        self.stream.set_nonblocking(true)?;
        if self.read_state == ReadState::Header {
            self.tick_read_header()
        } else {
            self.tick_read_body()
        }
    }

    /// Pushes due feed updates and enforces the heartbeat deadline.
    pub fn tick_write(&mut self) -> Result<()> {
        if self.last_read.elapsed() > HEARTBEAT_TIMEOUT {
            // The client has gone away. Try to say goodbye, but it is
            // probably not listening any more.
            info!(session_id = %self.session_id, "closing due to heartbeat timeout");
            self.shutdown()?;
            return Err(ServiceError::ClientTimeout);
        }

        let now = Instant::now();

        if let Some(ref receiver) = self.stats_receiver {
            if now - self.stats_last_write > self.stats_interval {
                if let Some(stats) = receiver.recv() {
                    self.write_msg(MsgType::Stats, &stats)?;
                    self.write()?;
                    self.stats_last_write = now;
                }
            }
        }

        if let Some(ref receiver) = self.motion_receiver {
            if now - self.motion_last_write > self.motion_interval {
                if let Some(motion) = receiver.recv() {
                    self.write_msg(MsgType::Motion, &motion)?;
                    self.write()?;
                    self.motion_last_write = now;
                }
            }
        }

        Ok(())
    }

    fn tick_read_header(&mut self) -> Result<bool> {
        {
            use std::io::ErrorKind::WouldBlock;

            let buf = &mut self.read_header_buf[self.read_bytes..];
            let bytes_read = match self.stream.read(buf) {
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == WouldBlock => Ok(0),
                Err(e) => {
                    error!(session_id = %self.session_id, error = %e, "couldn't read from socket");
                    Err(e)
                }
            }?;

            if bytes_read == 0 {
                return Ok(true);
            }
            self.read_bytes += bytes_read;
        }

        if self.read_bytes == HEADER_LEN {
            let header = Header::decode(&self.read_header_buf)?;
            info!(
                session_id = %self.session_id,
                msg_id = header.msg_id,
                msg_type = ?header.msg_type,
                msg_len = header.msg_len,
                "received message header"
            );

            // A shutdown is answered and ends the session regardless of any
            // body the client claims to have attached.
            if header.msg_type == MsgType::Shutdown {
                self.shutdown()?;
                return Ok(false);
            }

            if header.msg_type == MsgType::Heartbeat {
                self.last_read = Instant::now();
            }

            if header.msg_len > 0 {
                self.read_state = ReadState::Body;
                self.read_body_buf.resize(header.msg_len as usize, 0);
                self.pending = Some(header);
            } else {
                // Header-only message; start over on the next one.
                self.read_bytes = 0;
            }
        }

        Ok(true)
    }

    fn tick_read_body(&mut self) -> Result<bool> {
        let Some(header) = self.pending else {
            // Body state without a parsed header is a bookkeeping bug.
            debug_assert!(false, "read state machine out of sync");
            self.read_state = ReadState::Header;
            self.read_bytes = 0;
            return Ok(true);
        };

        {
            use std::io::ErrorKind::WouldBlock;

            let bytes_parsed = self.read_bytes - HEADER_LEN;
            let buf = &mut self.read_body_buf[bytes_parsed..];
            self.read_bytes += match self.stream.read(buf) {
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == WouldBlock => Ok(0),
                Err(e) => {
                    error!(session_id = %self.session_id, error = %e, "couldn't read from socket");
                    Err(e)
                }
            }?;
        }

        if (self.read_bytes - HEADER_LEN) as u32 == header.msg_len {
            info!(
                session_id = %self.session_id,
                msg_id = header.msg_id,
                msg_type = ?header.msg_type,
                "received body"
            );

            match header.msg_type {
                MsgType::Stats => {
                    let req: wire::StatsRequest = serde_json::from_slice(&self.read_body_buf)?;
                    self.subscribe_stats(req);
                }
                MsgType::Motion => {
                    let req: wire::MotionRequest = serde_json::from_slice(&self.read_body_buf)?;
                    self.subscribe_motion(req);
                }
                // Hello and heartbeat frames never carry a body; shutdown
                // is handled at the header stage.
                _ => return Err(ServiceError::InvalidRequest),
            }

            self.read_state = ReadState::Header;
            self.read_bytes = 0;
            self.pending = None;
        }
        Ok(true)
    }

    fn subscribe_stats(&mut self, req: wire::StatsRequest) {
        info!(
            session_id = %self.session_id,
            update_interval = req.update_interval,
            "stats subscription"
        );
        // A fresh request replaces whatever subscription was in place.
        self.stats_receiver.take();
        if req.update_interval == 0 {
            // Interval zero is the protocol for stopping the stream; the
            // take above has already dropped the receiver.
            return;
        }

        self.stats_interval = Duration::from_millis(req.update_interval as u64);
        self.stats_receiver = Some(self.exchange.subscribe_stats());
    }

    fn subscribe_motion(&mut self, req: wire::MotionRequest) {
        info!(
            session_id = %self.session_id,
            update_interval = req.update_interval,
            "motion subscription"
        );
        self.motion_receiver.take();
        if req.update_interval == 0 {
            return;
        }

        self.motion_interval = Duration::from_millis(req.update_interval as u64);
        self.motion_receiver = Some(self.exchange.subscribe_motion());
    }

    fn write_msg<T: Serialize>(&mut self, msg_type: MsgType, body: &T) -> Result<()> {
        wire::encode_frame(&mut self.write_buf, msg_type, rand::random::<u32>(), body)
    }

    /// Flushes the whole write buffer, spinning through `WouldBlock`.
    fn write(&mut self) -> Result<()> {
        use std::io::ErrorKind::WouldBlock;

        let mut num_sent = 0;
        while num_sent < self.write_buf.len() {
            let buf = &self.write_buf[num_sent..];
            num_sent += match self.stream.write(buf) {
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == WouldBlock => Ok(0),
                Err(e) => {
                    error!(session_id = %self.session_id, error = %e, "couldn't write to socket");
                    Err(e)
                }
            }?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring;
    use std::thread::sleep;

    fn request_header(msg_type: u8, msg_len: u32, msg_id: u32) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = wire::VERSION;
        raw[1] = msg_type;
        raw[2..6].copy_from_slice(&msg_len.to_le_bytes());
        raw[6..10].copy_from_slice(&msg_id.to_le_bytes());
        raw
    }

    /// Session wired to a socketpair plus the ring sender that keeps the
    /// exchange workers alive.
    fn session_pair() -> (Session, UnixStream, ring::Sender) {
        let (client, server) = UnixStream::pair().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let (tx, rx) = ring::channel(16);
        let exchange = Arc::new(Exchange::new(rx).unwrap());
        let session = Session::new(Arc::new(Config::default()), exchange, server);
        (session, client, tx)
    }

    fn read_response(client: &mut UnixStream) -> (u8, serde_json::Value) {
        let mut header = [0u8; HEADER_LEN];
        client.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).unwrap();
        (header[1], serde_json::from_slice(&body).unwrap())
    }

    fn pump_read(session: &mut Session, ticks: usize) -> bool {
        for _ in 0..ticks {
            if !session.tick_read().unwrap() {
                return false;
            }
            sleep(Duration::from_millis(2));
        }
        true
    }

    #[test]
    fn hello_handshake() {
        let (mut session, mut client, _tx) = session_pair();

        client
            .write_all(&request_header(b'A', 0, 77))
            .unwrap();
        session.read_hello().unwrap();
        assert_eq!(session.session_id().len(), 8);

        session.write_hello().unwrap();
        let (msg_type, body) = read_response(&mut client);
        assert_eq!(msg_type, b'a');
        assert_eq!(body["sessionId"], session.session_id());
        assert_eq!(body["config"]["frameWidth"], 640);
    }

    #[test]
    fn read_hello_rejects_other_message_types() {
        let (mut session, mut client, _tx) = session_pair();
        client.write_all(&request_header(b'H', 0, 1)).unwrap();
        assert!(matches!(
            session.read_hello(),
            Err(ServiceError::InvalidRequest)
        ));
    }

    #[test]
    fn read_hello_rejects_unexpected_body() {
        let (mut session, mut client, _tx) = session_pair();
        client.write_all(&request_header(b'A', 4, 1)).unwrap();
        assert!(matches!(
            session.read_hello(),
            Err(ServiceError::InvalidRequest)
        ));
    }

    #[test]
    fn stats_subscription_via_wire() {
        let (mut session, mut client, _tx) = session_pair();

        let body = br#"{"updateInterval":10}"#;
        client
            .write_all(&request_header(b'S', body.len() as u32, 2))
            .unwrap();
        client.write_all(body).unwrap();

        assert!(pump_read(&mut session, 50));
        assert!(session.stats_receiver.is_some());
        assert_eq!(session.stats_interval, Duration::from_millis(10));

        // Interval zero cancels the subscription again.
        let body = br#"{"updateInterval":0}"#;
        client
            .write_all(&request_header(b'S', body.len() as u32, 3))
            .unwrap();
        client.write_all(body).unwrap();

        assert!(pump_read(&mut session, 50));
        assert!(session.stats_receiver.is_none());
    }

    #[test]
    fn heartbeat_refreshes_the_deadline() {
        let (mut session, mut client, _tx) = session_pair();
        session.last_read = Instant::now() - Duration::from_secs(10);
        let stale = session.last_read;

        client.write_all(&request_header(b'H', 0, 4)).unwrap();
        assert!(pump_read(&mut session, 50));
        assert!(session.last_read > stale);
    }

    #[test]
    fn shutdown_request_ends_the_session() {
        let (mut session, mut client, _tx) = session_pair();

        client.write_all(&request_header(b'Z', 0, 5)).unwrap();
        let mut finished = false;
        for _ in 0..50 {
            if !session.tick_read().unwrap() {
                finished = true;
                break;
            }
            sleep(Duration::from_millis(2));
        }
        assert!(finished, "session must end on client shutdown");

        let (msg_type, _) = read_response(&mut client);
        assert_eq!(msg_type, b'z');
    }

    #[test]
    fn tick_write_times_out_a_silent_client() {
        let (mut session, mut client, _tx) = session_pair();
        session.last_read = Instant::now() - HEARTBEAT_TIMEOUT - Duration::from_secs(1);

        assert!(matches!(
            session.tick_write(),
            Err(ServiceError::ClientTimeout)
        ));
        let (msg_type, _) = read_response(&mut client);
        assert_eq!(msg_type, b'z');
    }

    #[test]
    fn tick_write_delivers_subscribed_stats() {
        let (mut session, mut client, _tx) = session_pair();

        let (mut feed_tx, feed_rx) = conflate::channel::<FrameStats>();
        feed_tx.send(FrameStats {
            timestamp: 9,
            mean: 1.5,
            std_dev: 0.0,
            min: 0.0,
            max: 3.0,
        });
        session.stats_receiver = Some(feed_rx);
        session.stats_interval = Duration::from_millis(1);
        session.stats_last_write = Instant::now() - Duration::from_secs(1);

        session.tick_write().unwrap();
        let (msg_type, body) = read_response(&mut client);
        assert_eq!(msg_type, b's');
        assert_eq!(body["timestamp"], 9);
        assert_eq!(body["mean"], 1.5);
    }

    #[test]
    fn malformed_body_type_is_rejected() {
        let (mut session, mut client, _tx) = session_pair();

        // A hello frame must not carry a body mid-session either.
        client.write_all(&request_header(b'A', 2, 6)).unwrap();
        client.write_all(b"{}").unwrap();

        let mut rejected = false;
        for _ in 0..50 {
            match session.tick_read() {
                Ok(_) => sleep(Duration::from_millis(2)),
                Err(ServiceError::InvalidRequest) => {
                    rejected = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(rejected);
    }
}
