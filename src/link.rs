use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::command::{CommandCodec, CommandSet};
use crate::frame::Frame;

/// Upper bound on one "frame ready" signal from the emulator
pub const SIGNAL_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Peer went away mid-session. Terminal: the link never reconnects.
    Lost,
}

/// Outcome of a link operation. Connection loss is a status, not an error.
#[derive(Debug, PartialEq)]
pub enum LinkStatus<T> {
    Ok(T),
    PeerClosed,
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("emulator refused {attempts} connection attempts on {addr}")]
    ConnectionFailed { addr: String, attempts: u32 },
    #[error("failed to connect to emulator: {0}")]
    Io(#[from] io::Error),
}

// =============================================================================
// Policies
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    /// Wait before every attempt, giving the emulator time to open its listener
    pub retry_delay: Duration,
    /// Bound on a single "frame ready" wait; `None` blocks indefinitely
    pub read_timeout: Option<Duration>,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay: Duration::from_secs(1),
            read_timeout: Some(Duration::from_secs(2)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FramePoll {
    pub interval: Duration,
    /// Give up on a frame that never becomes decodable; `None` spins forever
    pub timeout: Option<Duration>,
}

impl Default for FramePoll {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

// =============================================================================
// Frame Source Seam
// =============================================================================

/// What the play loop needs from a connection to the emulator.
pub trait FrameLink {
    /// Wait for the next "frame ready" signal and read the frame it announces
    fn next_frame(&mut self) -> LinkStatus<Frame>;
    fn send_command(&mut self, command: &CommandSet) -> LinkStatus<()>;
    fn state(&self) -> ConnectionState;
}

// =============================================================================
// TCP Link
// =============================================================================

pub struct EmulatorLink {
    stream: Option<TcpStream>,
    state: ConnectionState,
    signal: Vec<u8>,
    artifact: PathBuf,
    poll: FramePoll,
}

impl EmulatorLink {
    /// Unconnected link that reads frames from `artifact`
    pub fn new<P: Into<PathBuf>>(artifact: P, poll: FramePoll) -> Self {
        Self {
            stream: None,
            state: ConnectionState::Disconnected,
            signal: vec![0; SIGNAL_BUFFER],
            artifact: artifact.into(),
            poll,
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn connect(&mut self, addr: &str, policy: &ConnectPolicy) -> Result<(), LinkError> {
        self.state = ConnectionState::Connecting;
        for attempt in 1..=policy.max_attempts {
            thread::sleep(policy.retry_delay);
            match TcpStream::connect(addr).and_then(|s| Self::configure(s, policy)) {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.state = ConnectionState::Connected;
                    tracing::info!(addr, attempt, "connected to emulator");
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                    tracing::debug!(addr, attempt, "connection refused, retrying");
                }
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(err.into());
                }
            }
        }
        self.state = ConnectionState::Disconnected;
        tracing::warn!(addr, attempts = policy.max_attempts, "emulator refused connection");
        Err(LinkError::ConnectionFailed {
            addr: addr.to_string(),
            attempts: policy.max_attempts,
        })
    }

    fn configure(stream: TcpStream, policy: &ConnectPolicy) -> io::Result<TcpStream> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(policy.read_timeout)?;
        Ok(stream)
    }

    /// Block until the emulator announces a new frame
    pub fn await_frame_ready(&mut self) -> LinkStatus<usize> {
        if self.state != ConnectionState::Connected {
            return LinkStatus::PeerClosed;
        }
        let Some(stream) = self.stream.as_mut() else {
            return LinkStatus::PeerClosed;
        };
        let result = loop {
            match stream.read(&mut self.signal) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match result {
            Ok(0) => self.mark_lost("emulator closed the connection"),
            Ok(n) => LinkStatus::Ok(n),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                LinkStatus::Timeout
            }
            Err(err) => {
                tracing::debug!(error = %err, "read from emulator failed");
                self.mark_lost("connection reset by emulator")
            }
        }
    }

    /// Poll the shared artifact until it decodes
    pub fn fetch_frame(&self) -> LinkStatus<Frame> {
        fetch_frame(&self.artifact, &self.poll)
    }

    pub fn send(&mut self, command: &CommandSet) -> LinkStatus<()> {
        if self.state != ConnectionState::Connected {
            return LinkStatus::PeerClosed;
        }
        let Some(stream) = self.stream.as_mut() else {
            return LinkStatus::PeerClosed;
        };
        let line = CommandCodec::encode(command);
        match stream.write_all(line.as_bytes()) {
            Ok(()) => LinkStatus::Ok(()),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                LinkStatus::Timeout
            }
            Err(err) => {
                tracing::debug!(error = %err, "write to emulator failed");
                self.mark_lost("emulator closed the command pipe")
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if self.state != ConnectionState::Lost {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn mark_lost<T>(&mut self, reason: &str) -> LinkStatus<T> {
        tracing::warn!("{reason}");
        self.state = ConnectionState::Lost;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        LinkStatus::PeerClosed
    }
}

impl FrameLink for EmulatorLink {
    fn next_frame(&mut self) -> LinkStatus<Frame> {
        match self.await_frame_ready() {
            LinkStatus::Ok(_) => self.fetch_frame(),
            LinkStatus::PeerClosed => LinkStatus::PeerClosed,
            LinkStatus::Timeout => LinkStatus::Timeout,
        }
    }

    fn send_command(&mut self, command: &CommandSet) -> LinkStatus<()> {
        self.send(command)
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

impl Drop for EmulatorLink {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Shared Frame Artifact
// =============================================================================

/// The artifact is missing, partially written or otherwise undecodable
#[derive(Debug, thiserror::Error)]
pub enum FrameUnavailable {
    #[error("frame artifact unreadable: {0}")]
    Io(#[from] io::Error),
    #[error("frame artifact undecodable: {0}")]
    Decode(#[from] image::ImageError),
}

pub fn read_frame(path: &Path) -> Result<Frame, FrameUnavailable> {
    let bytes = std::fs::read(path)?;
    Ok(Frame::decode(&bytes)?)
}

pub fn fetch_frame(path: &Path, poll: &FramePoll) -> LinkStatus<Frame> {
    let started = Instant::now();
    let mut retries = 0u64;
    loop {
        match read_frame(path) {
            Ok(frame) => {
                if retries > 0 {
                    tracing::trace!(retries, "frame artifact became readable");
                }
                return LinkStatus::Ok(frame);
            }
            Err(err) => {
                if let Some(timeout) = poll.timeout {
                    if started.elapsed() >= timeout {
                        tracing::warn!(path = %path.display(), error = %err, "gave up waiting for frame");
                        return LinkStatus::Timeout;
                    }
                }
            }
        }
        retries += 1;
        thread::sleep(poll.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Button;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn quick_policy(attempts: u32) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts: attempts,
            retry_delay: Duration::from_millis(30),
            read_timeout: Some(Duration::from_millis(200)),
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("platformer-pilot-{}-{name}", std::process::id()))
    }

    #[test]
    fn connect_gives_up_after_max_attempts() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut link = EmulatorLink::new(temp_path("unused"), FramePoll::default());
        let started = Instant::now();
        let err = link.connect(&addr, &quick_policy(3)).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(90));
        match err {
            LinkError::ConnectionFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn signal_command_and_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"ready").unwrap();
            let mut line = String::new();
            BufReader::new(&conn).read_line(&mut line).unwrap();
            line
        });

        let mut link = EmulatorLink::new(temp_path("unused"), FramePoll::default());
        link.connect(&addr, &quick_policy(3)).unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(link.await_frame_ready(), LinkStatus::Ok(5));

        let command = CommandSet::empty().with(Button::Right).with(Button::B);
        assert_eq!(link.send(&command), LinkStatus::Ok(()));
        let line = server.join().unwrap();
        assert_eq!(CommandCodec::decode(&line).unwrap(), command);

        assert_eq!(link.await_frame_ready(), LinkStatus::PeerClosed);
        assert_eq!(link.state(), ConnectionState::Lost);
        assert_eq!(link.send(&command), LinkStatus::PeerClosed);
    }

    #[test]
    fn silent_peer_times_out_without_losing_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut link = EmulatorLink::new(temp_path("unused"), FramePoll::default());
        link.connect(&addr, &quick_policy(2)).unwrap();
        let _held = listener.accept().unwrap();
        assert_eq!(link.await_frame_ready(), LinkStatus::Timeout);
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[test]
    fn fetch_waits_for_artifact_to_appear() {
        let path = temp_path("late.png");
        let _ = std::fs::remove_file(&path);
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            image::RgbImage::from_pixel(256, 240, image::Rgb([10, 20, 30]))
                .save(&writer_path)
                .unwrap();
        });
        let poll = FramePoll {
            interval: Duration::from_millis(2),
            timeout: Some(Duration::from_secs(5)),
        };
        let status = fetch_frame(&path, &poll);
        writer.join().unwrap();
        match status {
            LinkStatus::Ok(frame) => assert_eq!((frame.width(), frame.height()), (256, 240)),
            _ => panic!("expected a frame"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fetch_times_out_on_garbage() {
        let path = temp_path("garbage.png");
        std::fs::write(&path, b"not an image").unwrap();
        let poll = FramePoll {
            interval: Duration::from_millis(2),
            timeout: Some(Duration::from_millis(30)),
        };
        assert!(matches!(fetch_frame(&path, &poll), LinkStatus::Timeout));
        let _ = std::fs::remove_file(&path);
    }
}
