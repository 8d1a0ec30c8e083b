//! Output sinks
//!
//! Turns a destination string into an open, writable sink:
//! - `tcp://a.b.c.d:port` connects to a TCP peer, or in listen mode waits
//!   for exactly one client on that address
//! - `udp://a.b.c.d:port` sends datagrams to a fixed peer
//! - `-` writes to stdout
//! - anything else is a local file, created or truncated
//!
//! When segmenting, the destination is first expanded with the segment
//! number or the local time (see [`pattern`]).

pub mod pattern;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::control::CancelFlag;

pub use pattern::{expand_destination, naming_for, SegmentNaming};

/// How long a client connection attempt may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a listening sink checks for cancellation while no client has connected
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Destination that writes to stdout and is never reopened on rotation
pub const STDOUT_DESTINATION: &str = "-";

/// A parsed, fully expanded destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkDescriptor {
    /// Local file, truncated on open
    LocalFile(PathBuf),
    /// Process stdout
    Stdout,
    /// Connect to a TCP listener
    TcpClient(SocketAddrV4),
    /// Bind, listen and accept a single TCP client
    TcpServer(SocketAddrV4),
    /// Connected UDP socket, write-only
    UdpClient(SocketAddrV4),
}

impl SinkDescriptor {
    /// Parse an expanded destination.
    ///
    /// Malformed network addresses and UDP listen mode are configuration
    /// errors and fail the caller.
    pub fn parse(destination: &str, listen: bool) -> Result<Self> {
        if let Some(rest) = destination.strip_prefix("tcp://") {
            let addr = parse_ipv4_port(rest)?;
            return Ok(if listen {
                SinkDescriptor::TcpServer(addr)
            } else {
                SinkDescriptor::TcpClient(addr)
            });
        }

        if let Some(rest) = destination.strip_prefix("udp://") {
            if listen {
                bail!("no support for listening in UDP mode ({})", destination);
            }
            return Ok(SinkDescriptor::UdpClient(parse_ipv4_port(rest)?));
        }

        if destination == STDOUT_DESTINATION {
            return Ok(SinkDescriptor::Stdout);
        }

        Ok(SinkDescriptor::LocalFile(PathBuf::from(destination)))
    }
}

impl fmt::Display for SinkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkDescriptor::LocalFile(path) => write!(f, "{}", path.display()),
            SinkDescriptor::Stdout => write!(f, "stdout"),
            SinkDescriptor::TcpClient(addr) => write!(f, "tcp://{}", addr),
            SinkDescriptor::TcpServer(addr) => write!(f, "tcp://{} (listen)", addr),
            SinkDescriptor::UdpClient(addr) => write!(f, "udp://{}", addr),
        }
    }
}

fn parse_ipv4_port(rest: &str) -> Result<SocketAddrV4> {
    let (host, port) = rest.split_once(':').with_context(|| {
        format!(
            "{} is not a valid IPv4:port, use something like tcp://1.2.3.4:1234 or udp://1.2.3.4:1234",
            rest
        )
    })?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("port parse failed for network destination {}", rest))?;
    let ip: Ipv4Addr = host
        .parse()
        .with_context(|| format!("{} is not a valid IPv4 address", host))?;
    Ok(SocketAddrV4::new(ip, port))
}

/// Anything the router can write encoded bytes into.
pub trait Sink: Write + Send {
    /// Push buffered data down to the medium (flush + fsync for files)
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Boxed sink as held by the router
pub type SinkHandle = Box<dyn Sink>;

/// An open output
pub enum OutputSink {
    File(File),
    Stdout(io::Stdout),
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputSink::File(file) => file.write(buf),
            OutputSink::Stdout(out) => out.write(buf),
            OutputSink::Tcp(stream) => stream.write(buf),
            OutputSink::Udp(socket) => socket.send(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputSink::File(file) => file.flush(),
            OutputSink::Stdout(out) => out.flush(),
            OutputSink::Tcp(stream) => stream.flush(),
            OutputSink::Udp(_) => Ok(()),
        }
    }
}

impl Sink for OutputSink {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        if let OutputSink::File(file) = self {
            file.sync_data()?;
        }
        Ok(())
    }
}

/// Write as much of `data` as the sink accepts.
///
/// Returns the bytes actually transferred; anything short of `data.len()`
/// means the sink has failed. Interrupted writes are resumed, nothing else
/// is retried.
pub fn write_counted<W: Write + ?Sized>(sink: &mut W, data: &[u8]) -> usize {
    let mut written = 0;
    while written < data.len() {
        match sink.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Sink write error after {} bytes: {}", written, e);
                break;
            }
        }
    }
    written
}

/// Opens sinks for destination strings.
#[derive(Debug, Clone, Default)]
pub struct SinkResolver {
    /// TCP destinations accept one client instead of connecting
    pub listen: bool,
    /// Destinations are expanded per segment
    pub segmenting: bool,
    cancel: CancelFlag,
}

impl SinkResolver {
    pub fn new(listen: bool, segmenting: bool) -> Self {
        Self {
            listen,
            segmenting,
            cancel: CancelFlag::new(),
        }
    }

    /// Give up waiting for a TCP client once `cancel` is set
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Expand `destination` for the given segment when segmenting
    pub fn expand(&self, destination: &str, segment_number: u32, now: &DateTime<Local>) -> Result<String> {
        if self.segmenting {
            debug!(
                "Expanding {} for segment {} ({:?} naming)",
                destination,
                segment_number,
                naming_for(destination)
            );
            expand_destination(destination, segment_number, now)
        } else {
            Ok(destination.to_string())
        }
    }

    /// Resolve and open a sink.
    ///
    /// `Err` means the destination itself is malformed. `Ok(None)` means the
    /// destination was valid but could not be opened; the reason is logged.
    pub fn resolve(
        &self,
        destination: &str,
        segment_number: u32,
        now: &DateTime<Local>,
    ) -> Result<Option<OutputSink>> {
        let expanded = self.expand(destination, segment_number, now)?;
        let descriptor = SinkDescriptor::parse(&expanded, self.listen)?;
        let sink = open_descriptor(&descriptor, &self.cancel);

        match &sink {
            Some(_) => info!("Opening output {}", descriptor),
            None => error!("Failed to open output {}", descriptor),
        }
        Ok(sink)
    }
}

/// Opens the sink for one segment of a destination.
pub trait SinkOpener: Send + Sync {
    /// `Ok(None)` when the destination is valid but could not be opened
    fn open(&self, destination: &str, segment_number: u32) -> Result<Option<SinkHandle>>;
}

impl SinkOpener for SinkResolver {
    fn open(&self, destination: &str, segment_number: u32) -> Result<Option<SinkHandle>> {
        let sink = self.resolve(destination, segment_number, &Local::now())?;
        Ok(sink.map(|s| Box::new(s) as SinkHandle))
    }
}

/// Open a parsed descriptor, logging the reason on failure.
///
/// A listening sink stops waiting for its client once `cancel` is set.
pub fn open_descriptor(descriptor: &SinkDescriptor, cancel: &CancelFlag) -> Option<OutputSink> {
    match descriptor {
        SinkDescriptor::LocalFile(path) => match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
        {
            Ok(file) => Some(OutputSink::File(file)),
            Err(e) => {
                error!("Error opening output file {}: {}", path.display(), e);
                None
            }
        },
        SinkDescriptor::Stdout => Some(OutputSink::Stdout(io::stdout())),
        SinkDescriptor::TcpClient(addr) => connect_tcp(*addr).map(OutputSink::Tcp),
        SinkDescriptor::TcpServer(addr) => accept_one(*addr, cancel).map(OutputSink::Tcp),
        SinkDescriptor::UdpClient(addr) => connect_udp(*addr).map(OutputSink::Udp),
    }
}

fn connect_tcp(addr: SocketAddrV4) -> Option<TcpStream> {
    info!("Connecting to {}...", addr);
    loop {
        match TcpStream::connect_timeout(&SocketAddr::V4(addr), CONNECT_TIMEOUT) {
            Ok(stream) => {
                info!("Connected to {}, sending video", addr);
                return Some(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Error connecting to {}: {}", addr, e);
                return None;
            }
        }
    }
}

fn accept_one(addr: SocketAddrV4, cancel: &CancelFlag) -> Option<TcpStream> {
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Error binding socket on {}: {}", addr, e);
            return None;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        error!("Error configuring socket on {}: {}", addr, e);
        return None;
    }

    info!("Waiting for a TCP connection on {}...", addr);
    // The listener is dropped on return: only one client is ever served
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    error!("Error configuring connection from {}: {}", peer, e);
                    return None;
                }
                info!("Client connected from {}", peer);
                return Some(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if cancel.is_cancelled() {
                    warn!("Stopped waiting for a TCP connection on {}", addr);
                    return None;
                }
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Error on accept: {}", e);
                return None;
            }
        }
    }
}

fn connect_udp(addr: SocketAddrV4) -> Option<UdpSocket> {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Error creating UDP socket: {}", e);
            return None;
        }
    };
    match socket.connect(addr) {
        Ok(()) => {
            info!("UDP output to {}", addr);
            Some(socket)
        }
        Err(e) => {
            error!("Error setting UDP peer {}: {}", addr, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn parse_network_descriptors() {
        assert_eq!(
            SinkDescriptor::parse("tcp://127.0.0.1:5000", false).unwrap(),
            SinkDescriptor::TcpClient("127.0.0.1:5000".parse().unwrap())
        );
        assert_eq!(
            SinkDescriptor::parse("tcp://0.0.0.0:5000", true).unwrap(),
            SinkDescriptor::TcpServer("0.0.0.0:5000".parse().unwrap())
        );
        assert_eq!(
            SinkDescriptor::parse("udp://10.1.2.3:9000", false).unwrap(),
            SinkDescriptor::UdpClient("10.1.2.3:9000".parse().unwrap())
        );
    }

    #[test]
    fn parse_rejects_malformed_addresses() {
        assert!(SinkDescriptor::parse("tcp://127.0.0.1", false).is_err());
        assert!(SinkDescriptor::parse("tcp://127.0.0.1:notaport", false).is_err());
        assert!(SinkDescriptor::parse("tcp://127.0.0.1:70000", false).is_err());
        assert!(SinkDescriptor::parse("udp://camera.local:5000", false).is_err());
    }

    #[test]
    fn udp_listen_is_unsupported() {
        assert!(SinkDescriptor::parse("udp://0.0.0.0:5000", true).is_err());
    }

    #[test]
    fn plain_strings_are_files() {
        assert_eq!(
            SinkDescriptor::parse("video.h264", false).unwrap(),
            SinkDescriptor::LocalFile(PathBuf::from("video.h264"))
        );
        assert_eq!(SinkDescriptor::parse("-", false).unwrap(), SinkDescriptor::Stdout);
    }

    #[test]
    fn resolve_numbered_segment_file() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("clip_%04d.h264");
        let resolver = SinkResolver::new(false, true);

        let sink = resolver
            .resolve(template.to_str().unwrap(), 7, &Local::now())
            .unwrap();
        assert!(sink.is_some());
        assert!(dir.path().join("clip_0007.h264").exists());
    }

    #[test]
    fn resolve_without_segmenting_keeps_name_verbatim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw_%d.h264");
        let resolver = SinkResolver::new(false, false);
        resolver
            .resolve(path.to_str().unwrap(), 3, &Local::now())
            .unwrap()
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn resolve_timestamp_pattern() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("rec_%Y.h264");
        let now = Local::now();
        let resolver = SinkResolver::new(false, true);
        resolver
            .resolve(template.to_str().unwrap(), 1, &now)
            .unwrap()
            .unwrap();
        let expected = dir.path().join(format!("rec_{}.h264", now.format("%Y")));
        assert!(expected.exists());
    }

    #[test]
    fn unopenable_file_yields_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("out.h264");
        let resolver = SinkResolver::default();
        let sink = resolver.resolve(path.to_str().unwrap(), 1, &Local::now()).unwrap();
        assert!(sink.is_none());
    }

    #[test]
    fn refused_tcp_connection_yields_none() {
        // Bind then drop to find a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let resolver = SinkResolver::default();
        let sink = resolver
            .resolve(&format!("tcp://127.0.0.1:{}", port), 1, &Local::now())
            .unwrap();
        assert!(sink.is_none());
    }

    #[test]
    fn tcp_client_sink_delivers_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let resolver = SinkResolver::default();

        let mut sink = resolver
            .resolve(&format!("tcp://127.0.0.1:{}", port), 1, &Local::now())
            .unwrap()
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        assert_eq!(write_counted(&mut sink, b"\x00\x00\x00\x01\x67"), 5);
        drop(sink);
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"\x00\x00\x00\x01\x67");
    }

    #[test]
    fn tcp_listen_accepts_single_client() {
        // Reserve a free port, release it, then listen on it
        let port = {
            let free = TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let client = std::thread::spawn(move || {
            for _ in 0..200 {
                if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).unwrap();
                    return buf;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            panic!("could not connect to listening sink");
        });

        let resolver = SinkResolver::new(true, false);
        let mut sink = resolver
            .resolve(&format!("tcp://127.0.0.1:{}", port), 1, &Local::now())
            .unwrap()
            .unwrap();
        sink.write_all(b"hello").unwrap();
        drop(sink);

        assert_eq!(client.join().unwrap(), b"hello");
    }

    #[test]
    fn cancelled_listen_gives_up_without_client() {
        let port = {
            let free = TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let cancel = CancelFlag::new();
        let canceller = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let resolver = SinkResolver::new(true, false).with_cancel(cancel);
        let started = std::time::Instant::now();
        let sink = resolver
            .resolve(&format!("tcp://127.0.0.1:{}", port), 1, &Local::now())
            .unwrap();
        assert!(sink.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn udp_sink_sends_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut sink = SinkResolver::default()
            .resolve(&format!("udp://127.0.0.1:{}", port), 1, &Local::now())
            .unwrap()
            .unwrap();
        assert_eq!(write_counted(&mut sink, b"datagram"), 8);

        let mut buf = [0u8; 32];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }

    struct Limited {
        room: usize,
    }

    impl Write for Limited {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.room).min(3);
            self.room -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_counted_reports_short_writes() {
        let mut sink = Limited { room: 7 };
        assert_eq!(write_counted(&mut sink, &[0u8; 10]), 7);
        let mut sink = Limited { room: 100 };
        assert_eq!(write_counted(&mut sink, &[0u8; 10]), 10);
    }
}
