use std::sync::Arc;
use std::time::Duration;

use baratron_core::BoxStr;
use baratron_core::protocol::{DELIMITER, LINE_ENDING, MAX_FRAME_LEN};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::{AnyDelimiterCodec, Decoder};
use tracing::{debug, info, instrument, trace, warn};

use crate::{ConnectionError, Error};

/// One TCP stream to one device, plus the bytes read from it that have not
/// formed a complete frame yet.
///
/// The connection never reconnects by itself; the dispatcher decides when to
/// call [`Connection::ensure_connected`] again.
pub struct Connection {
    addr: BoxStr,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    codec: AnyDelimiterCodec,
    last_activity: Option<Instant>,
}

// about 30 years; stands in for "no deadline"
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + timeout`, saturating at a far-future instant.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

fn frame_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(vec![DELIMITER], LINE_ENDING.to_vec(), MAX_FRAME_LEN)
}

impl Connection {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        Self {
            addr: addr.into(),
            connect_timeout,
            stream: None,
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
            codec: frame_codec(),
            last_activity: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Time of the last successful connect, write or read.
    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[instrument(skip(self), fields(addr = %self.addr))]
    pub async fn ensure_connected(&mut self) -> Result<(), ConnectionError> {
        if self.stream.is_some() {
            return Ok(());
        }

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&*self.addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "TCP_NODELAY not set");
                }
                self.reset_buffer();
                self.stream = Some(stream);
                self.last_activity = Some(Instant::now());
                info!("connected");
                Ok(())
            }
            Ok(Err(e)) => {
                debug!(error = %e, "connect failed");
                Err(ConnectionError::Connect {
                    addr: self.addr.clone(),
                    source: Arc::new(e),
                })
            }
            Err(_) => {
                debug!(after = ?self.connect_timeout, "connect timed out");
                Err(ConnectionError::ConnectTimeout {
                    addr: self.addr.clone(),
                    after: self.connect_timeout,
                })
            }
        }
    }

    /// Writes all of `bytes`. A failed write closes the connection.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;

        if let Err(e) = stream.write_all(bytes).await {
            warn!(addr = %self.addr, error = %e, "write failed");
            self.disconnect();
            return Err(ConnectionError::Write(Arc::new(e)));
        }

        trace!(addr = %self.addr, len = bytes.len(), "sent");
        self.last_activity = Some(Instant::now());
        Ok(())
    }

    /// Returns the next complete frame, reading more bytes as needed.
    ///
    /// On [`Error::Timeout`] any partial frame stays buffered for the next
    /// call. A closed or failed socket discards the buffer and disconnects;
    /// so does a frame that overruns the maximum length, since the frame
    /// boundaries can no longer be trusted.
    pub async fn receive_until(&mut self, timeout: Duration) -> Result<Bytes, Error> {
        let deadline = deadline_after(Instant::now(), timeout);

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "frame overrun");
                    self.disconnect();
                    return Err(Error::ProtocolDesync(e.to_string().into()));
                }
            }

            let stream = self.stream.as_mut().ok_or(ConnectionError::NotConnected)?;
            match tokio::time::timeout_at(deadline, stream.read_buf(&mut self.buffer)).await {
                Err(_) => return Err(Error::Timeout(timeout)),
                Ok(Ok(0)) => {
                    debug!(addr = %self.addr, "device closed the connection");
                    self.disconnect();
                    return Err(ConnectionError::Closed.into());
                }
                Ok(Ok(n)) => {
                    trace!(addr = %self.addr, n, "received");
                    self.last_activity = Some(Instant::now());
                }
                Ok(Err(e)) => {
                    warn!(addr = %self.addr, error = %e, "read failed");
                    self.disconnect();
                    return Err(ConnectionError::Read(Arc::new(e)).into());
                }
            }
        }
    }

    /// Drops the socket and any buffered bytes. Safe to call when already
    /// disconnected.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(addr = %self.addr, "disconnected");
        }
        self.reset_buffer();
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        // the codec remembers how far it scanned into the old buffer
        self.codec = frame_codec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut conn = Connection::new("127.0.0.1", port, Duration::from_secs(1));
        let (accepted, connected) = tokio::join!(listener.accept(), conn.ensure_connected());
        connected.unwrap();
        (conn, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn reassembles_split_frames() {
        let (mut conn, mut peer) = pair().await;
        let connected_at = conn.last_activity().unwrap();

        peer.write_all(b"EVID_100 74").await.unwrap();
        let err = conn.receive_until(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(conn.buffered(), 11);

        peer.write_all(b"6.07 torr\r\nEVID_1103 1000 torr\r\n").await.unwrap();
        let first = conn.receive_until(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&first[..], b"EVID_100 746.07 torr\r");
        let second = conn.receive_until(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&second[..], b"EVID_1103 1000 torr\r");
        assert!(conn.last_activity().unwrap() >= connected_at);
        assert_eq!(conn.buffered(), 0);
    }

    #[tokio::test]
    async fn peer_close_discards_buffer() {
        let (mut conn, mut peer) = pair().await;

        peer.write_all(b"EVID_100 1").await.unwrap();
        drop(peer);

        let err = conn.receive_until(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
        assert!(!conn.is_connected());
        assert_eq!(conn.buffered(), 0);
    }

    #[tokio::test]
    async fn overlong_frame_disconnects() {
        let (mut conn, mut peer) = pair().await;

        peer.write_all(&[b'x'; MAX_FRAME_LEN + 8]).await.unwrap();
        let err = conn.receive_until(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolDesync(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut conn = Connection::new("127.0.0.1", port, Duration::from_secs(1));

        let err = conn.ensure_connected().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Connect { .. }));
        assert!(matches!(
            conn.send(b"GET EVID_100\r\n").await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn brackets_ipv6_hosts() {
        let conn = Connection::new("fe80::1", 80, Duration::from_secs(1));
        assert_eq!(conn.addr(), "[fe80::1]:80");
        let conn = Connection::new("10.0.0.5", 4001, Duration::from_secs(1));
        assert_eq!(conn.addr(), "10.0.0.5:4001");
    }
}
