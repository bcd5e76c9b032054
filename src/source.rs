use crate::camera::CameraIntrinsics;
use crate::error::Result;
use crate::frame::{ColorFrame, RawDepthFrame};
use crate::transform::Pose;

/// One capture of a frame source.
#[derive(Clone, Debug)]
pub struct SourceFrame {
    pub depth: RawDepthFrame,
    pub color: Option<ColorFrame>,
    /// Camera pose from the source, when known (synthetic scenes, recorded ground truth).
    pub ground_truth: Option<Pose>,
}

/// A stream of raw sensor frames, real or synthetic.
pub trait FrameSource: Send {
    /// Calibration of the depth camera.
    fn calibration(&self) -> &CameraIntrinsics;

    /// Next frame in capture order, `None` once the stream has ended.
    fn next_frame(&mut self) -> Result<Option<SourceFrame>>;

    /// Restarts the stream from its first frame.
    fn rewind(&mut self) -> Result<()>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn calibration(&self) -> &CameraIntrinsics {
        (**self).calibration()
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        (**self).next_frame()
    }

    fn rewind(&mut self) -> Result<()> {
        (**self).rewind()
    }
}

/// A source ending after at most `max_frames` frames.
pub struct Limited<S> {
    source: S,
    max_frames: usize,
    read: usize,
}

impl<S: FrameSource> Limited<S> {
    pub fn new(source: S, max_frames: usize) -> Self {
        Self {
            source,
            max_frames,
            read: 0,
        }
    }
}

impl<S: FrameSource> FrameSource for Limited<S> {
    fn calibration(&self) -> &CameraIntrinsics {
        self.source.calibration()
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        if self.read >= self.max_frames {
            return Ok(None);
        }
        let frame = self.source.next_frame()?;
        if frame.is_some() {
            self.read += 1;
        }
        Ok(frame)
    }

    fn rewind(&mut self) -> Result<()> {
        self.read = 0;
        self.source.rewind()
    }
}
