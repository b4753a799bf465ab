//! Remote stream backend: an external decoder process writes fixed-size raw
//! BGR24 frames to its stdout and the acquisition loop reads them one frame at
//! a time.
//!
//! A short read (decoder exit, stream end, killed during stop) is a backend
//! failure and ends the loop.

use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use super::{Grabber, SourceSettings};
use crate::frame::Frame;

pub(crate) struct PipeGrabber {
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frame_len: usize,
}

impl Grabber for PipeGrabber {
    fn grab(&mut self, seq: u64) -> Result<Frame> {
        let mut data = vec![0u8; self.frame_len];
        self.stdout
            .read_exact(&mut data)
            .context("short read from decoder pipe")?;
        Ok(Frame::new(data, self.width, self.height, seq))
    }
}

pub(crate) fn decoder_args(url: &str, settings: &SourceSettings) -> Vec<String> {
    vec![
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        url.to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", settings.width, settings.height),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "bgr24".to_string(),
        "-an".to_string(),
        "-sn".to_string(),
        "-tune".to_string(),
        "zerolatency".to_string(),
        "-".to_string(),
    ]
}

pub(crate) fn spawn_decoder(url: &str, settings: &SourceSettings) -> Result<(PipeGrabber, Child)> {
    let mut child = Command::new(&settings.decoder)
        .args(decoder_args(url, settings))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn decoder '{}' for {}", settings.decoder, url))?;

    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("decoder stdout was not captured");
        }
    };

    log::debug!(
        "decoder '{}' spawned for {} (pid {})",
        settings.decoder,
        url,
        child.id()
    );

    Ok((
        PipeGrabber {
            stdout,
            width: settings.width,
            height: settings.height,
            frame_len: Frame::byte_len_for(settings.width, settings.height),
        },
        child,
    ))
}
