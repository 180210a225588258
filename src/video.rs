use anyhow::{Context, Result};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::frame::Frame;
use crate::{NES_HEIGHT, NES_WIDTH};

/// Sequential frame source for the training pipeline.
pub trait VideoSource {
    /// `None` once the stream is exhausted
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Total frames if known up front; only used for progress reporting
    fn frame_count(&self) -> Option<u64>;
}

const FRAME_BYTES: usize = (NES_WIDTH * NES_HEIGHT * 3) as usize;

/// Decodes a video file by piping raw rgb24 frames out of `ffmpeg`, already
/// scaled to the native resolution.
pub struct FfmpegVideo {
    path: PathBuf,
    child: Child,
    stdout: BufReader<ChildStdout>,
    frame_count: Option<u64>,
    finished: bool,
}

impl FfmpegVideo {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            anyhow::bail!("Video not found: {}", path.display());
        }
        let mut video = Self::spawn(Path::new("ffmpeg"), &decoder_args(path))
            .with_context(|| format!("Failed to open video: {}", path.display()))?;
        video.path = path.to_path_buf();
        video.frame_count = count_frames(path);
        Ok(video)
    }

    /// Read frames from any program that writes raw native-size rgb24 to stdout
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to launch decoder: {}", program.display()))?;
        let stdout = child
            .stdout
            .take()
            .context("decoder stdout was not captured")?;
        Ok(Self {
            path: program.to_path_buf(),
            child,
            stdout: BufReader::new(stdout),
            frame_count: None,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VideoSource for FfmpegVideo {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }
        let mut data = vec![0u8; FRAME_BYTES];
        match self.stdout.read_exact(&mut data) {
            Ok(()) => Ok(Frame::from_rgb24(NES_WIDTH, NES_HEIGHT, data)),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                self.finished = true;
                let status = self.child.wait()?;
                if !status.success() {
                    anyhow::bail!(
                        "decoder failed on {} ({status})",
                        self.path.display()
                    );
                }
                Ok(None)
            }
            Err(err) => Err(err).context("Failed to read decoded frame"),
        }
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }
}

impl Drop for FfmpegVideo {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub fn decoder_args(path: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-v", "error", "-i"].map(String::from).into();
    args.push(path.to_string_lossy().into_owned());
    args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s"].map(String::from));
    args.push(format!("{NES_WIDTH}x{NES_HEIGHT}"));
    args.push("-".to_string());
    args
}

fn count_frames(path: &Path) -> Option<u64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=nb_read_packets",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().parse().ok(),
        Ok(_) | Err(_) => {
            tracing::debug!(path = %path.display(), "frame count unavailable");
            None
        }
    }
}
