//! Network clients decoding `4 x n_channel` little-endian f32 frames.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::{debug, info};

use crate::ads1299::codec::decode_f32_le;
use crate::drivers::{
    Acquired, ReaderError, Result, Sample, SampleSource, StreamFormat, StreamRequest,
};

/// Token existing servers wait for before they drop the connection.
const SHUTDOWN_TOKEN: &[u8] = b"shutdown";
const MAX_DATAGRAM: usize = 65_507;

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn read_timeout(timeout_ms: u64) -> Option<Duration> {
    Some(Duration::from_millis(timeout_ms.max(1)))
}

pub struct TcpSource {
    address: String,
    timeout_ms: u64,
    stream: Option<TcpStream>,
    frame: Vec<u8>,
    filled: usize,
}

impl TcpSource {
    pub fn new(address: String, timeout_ms: u64) -> Self {
        Self {
            address,
            timeout_ms,
            stream: None,
            frame: Vec::new(),
            filled: 0,
        }
    }

    fn label(&self) -> String {
        format!("tcp {}", self.address)
    }
}

impl SampleSource for TcpSource {
    fn name(&self) -> &str {
        "tcp"
    }

    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        let stream = TcpStream::connect(&self.address)
            .map_err(|e| ReaderError::unavailable(self.label(), e))?;
        stream
            .set_read_timeout(read_timeout(self.timeout_ms))
            .map_err(|e| ReaderError::unavailable(self.label(), e))?;
        stream.set_nodelay(true).ok();
        info!("connected to {}", self.address);
        self.stream = Some(stream);
        self.frame = vec![0u8; 4 * request.n_channel];
        self.filled = 0;
        Ok(StreamFormat {
            n_channel: request.n_channel,
            sample_rate: request.sample_rate,
            label: self.label(),
        })
    }

    /// A frame split across timeouts is completed on the next call; an idle
    /// connection yields `Skip`.
    fn produce(&mut self) -> Result<Acquired> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ReaderError::NotStarted);
        };
        while self.filled < self.frame.len() {
            match stream.read(&mut self.frame[self.filled..]) {
                Ok(0) => {
                    return Err(ReaderError::unavailable(
                        format!("tcp {}", self.address),
                        "connection closed by peer",
                    ))
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) && self.filled == 0 => return Ok(Acquired::Skip),
                Err(e) if is_timeout(&e) => {
                    return Err(ReaderError::transient(
                        "tcp receive",
                        format!("short read: {} of {} bytes", self.filled, self.frame.len()),
                    ))
                }
                Err(e) => return Err(ReaderError::unavailable(format!("tcp {}", self.address), e)),
            }
        }
        self.filled = 0;
        Ok(Acquired::Sample(Sample::new(decode_f32_le(&self.frame))))
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.write_all(SHUTDOWN_TOKEN) {
                debug!("tcp {}: shutdown token not sent: {e}", self.address);
            }
            stream.shutdown(Shutdown::Both).ok();
        }
    }
}

pub struct UdpSource {
    bind: String,
    peer: Option<String>,
    timeout_ms: u64,
    socket: Option<UdpSocket>,
    frame_len: usize,
    datagram: Vec<u8>,
}

impl UdpSource {
    pub fn new(bind: String, peer: Option<String>, timeout_ms: u64) -> Self {
        Self {
            bind,
            peer,
            timeout_ms,
            socket: None,
            frame_len: 0,
            datagram: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// Bound address once opened, useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn label(&self) -> String {
        format!("udp {}", self.bind)
    }
}

impl SampleSource for UdpSource {
    fn name(&self) -> &str {
        "udp"
    }

    fn open(&mut self, request: &StreamRequest) -> Result<StreamFormat> {
        let socket =
            UdpSocket::bind(&self.bind).map_err(|e| ReaderError::unavailable(self.label(), e))?;
        if let Some(peer) = &self.peer {
            let addr = peer
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| ReaderError::unavailable(self.label(), format!("bad peer {peer}")))?;
            socket
                .connect(addr)
                .map_err(|e| ReaderError::unavailable(self.label(), e))?;
        }
        socket
            .set_read_timeout(read_timeout(self.timeout_ms))
            .map_err(|e| ReaderError::unavailable(self.label(), e))?;
        self.socket = Some(socket);
        self.frame_len = 4 * request.n_channel;
        Ok(StreamFormat {
            n_channel: request.n_channel,
            sample_rate: request.sample_rate,
            label: self.label(),
        })
    }

    fn produce(&mut self) -> Result<Acquired> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(ReaderError::NotStarted);
        };
        let len = match socket.recv_from(&mut self.datagram) {
            Ok((len, _)) => len,
            Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => {
                return Ok(Acquired::Skip)
            }
            Err(e) => return Err(ReaderError::transient("udp receive", e)),
        };
        if len != self.frame_len {
            return Err(ReaderError::protocol(
                "udp receive",
                format!("datagram of {len} bytes, expected {}", self.frame_len),
            ));
        }
        Ok(Acquired::Sample(Sample::new(decode_f32_le(&self.datagram[..len]))))
    }

    fn close(&mut self) {
        self.socket = None;
    }
}
