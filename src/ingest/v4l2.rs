//! Local capture device backend.
//!
//! Device `N` maps to `/dev/videoN`. Real capture uses libv4l and is only
//! compiled with the `ingest-v4l2` feature; without it, opening a local device
//! fails and the camera never becomes ready.

use anyhow::Result;

use super::{Grabber, SourceSettings};

pub(crate) fn device_path(index: u32) -> String {
    format!("/dev/video{}", index)
}

#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
const BGR24_FOURCC: &[u8; 4] = b"BGR3";

/// Frames are sliced as packed BGR24; a device that negotiated any other
/// layout would be misread.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) fn ensure_bgr24(path: &str, offered: &[u8; 4]) -> Result<()> {
    if offered != BGR24_FOURCC {
        anyhow::bail!(
            "v4l2 device {} does not support BGR3 capture (offered {})",
            path,
            String::from_utf8_lossy(offered)
        );
    }
    Ok(())
}

#[cfg(not(feature = "ingest-v4l2"))]
pub(crate) fn open_device(index: u32, _settings: &SourceSettings) -> Result<Box<dyn Grabber>> {
    anyhow::bail!(
        "local capture device {} requires the ingest-v4l2 feature",
        device_path(index)
    )
}

#[cfg(feature = "ingest-v4l2")]
pub(crate) fn open_device(index: u32, settings: &SourceSettings) -> Result<Box<dyn Grabber>> {
    Ok(Box::new(device::DeviceGrabber::open(
        &device_path(index),
        settings,
    )?))
}

#[cfg(feature = "ingest-v4l2")]
mod device {
    use anyhow::{Context, Result};
    use ouroboros::self_referencing;

    use super::super::{Grabber, SourceSettings};
    use crate::frame::Frame;

    pub(crate) struct DeviceGrabber {
        path: String,
        state: DeviceState,
        width: u32,
        height: u32,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceGrabber {
        pub(crate) fn open(path: &str, settings: &SourceSettings) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device = v4l::Device::with_path(path)
                .with_context(|| format!("open v4l2 device {}", path))?;
            let mut format = device.format().context("read v4l2 format")?;
            format.width = settings.width;
            format.height = settings.height;
            format.fourcc = v4l::FourCC::new(super::BGR24_FOURCC);

            let format = device
                .set_format(&format)
                .with_context(|| format!("set BGR3 format on {}", path))?;
            super::ensure_bgr24(path, &format.fourcc.repr)?;

            if settings.target_fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(settings.target_fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!("v4l2: failed to set fps on {}: {}", path, err);
                }
            }

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            log::info!("v4l2: opened {} ({}x{})", path, format.width, format.height);
            Ok(Self {
                path: path.to_string(),
                state,
                width: format.width,
                height: format.height,
            })
        }
    }

    impl Grabber for DeviceGrabber {
        fn grab(&mut self, seq: u64) -> Result<Frame> {
            use v4l::io::traits::CaptureStream;

            let (buf, _meta) = self
                .state
                .with_mut(|fields| fields.stream.next())
                .with_context(|| format!("capture frame from {}", self.path))?;

            let expected = Frame::byte_len_for(self.width, self.height);
            let data = buf
                .get(..expected)
                .with_context(|| format!("short frame from {}", self.path))?
                .to_vec();
            Ok(Frame::new(data, self.width, self.height, seq))
        }
    }
}
