use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::camera::CameraIntrinsics;
use crate::config::IntakeParams;
use crate::error::{Error, Result};
use crate::frame::{ColorFrame, RawDepthFrame};
use crate::intake::{AcceptedPair, FrameIntake, IntakeStats, Rejection};
use crate::marching_cubes::MarchingCubes;
use crate::mesh::Mesh;
use crate::session::{FrameOutcome, ProcessedFrame, Session};
use crate::source::FrameSource;
use crate::sync::{CancelToken, FrameSlot, PoseCell};
use crate::tracker::LostReason;
use crate::volume::Volume;

/// How long the worker waits for a frame before checking for a reset.
const WORKER_POLL: Duration = Duration::from_millis(20);
/// Events kept for a consumer that does not poll.
const EVENT_CAPACITY: usize = 1024;

/// Notifications of the scanning threads, in processing order.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanEvent {
    Rejected { timestamp: f64, reason: Rejection },
    Tracked(ProcessedFrame),
    Lost { timestamp: f64, reason: LostReason },
    /// The frame was in flight when the session was reset.
    Discarded { timestamp: f64 },
    /// The worker reset the session.
    Reset,
    /// Processing failed, the frame was skipped.
    Failed { timestamp: f64, message: String },
}

/// Bounded event queue sender. Events that do not fit are dropped and counted.
#[derive(Clone)]
struct EventSender {
    sender: SyncSender<ScanEvent>,
    dropped: Arc<AtomicUsize>,
}

impl EventSender {
    fn channel(capacity: usize) -> (Self, Receiver<ScanEvent>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (
            Self {
                sender,
                dropped: Arc::new(AtomicUsize::new(0)),
            },
            receiver,
        )
    }

    fn send(&self, event: ScanEvent) {
        match self.sender.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "event queue full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => debug!("event receiver disconnected"),
        }
    }

    fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Job {
    pair: AcceptedPair,
    epoch: u64,
}

struct Control {
    epoch: u64,
    cancel: CancelToken,
}

struct Shared {
    slot: FrameSlot<Job>,
    control: Mutex<Control>,
    pose: Arc<PoseCell>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> (u64, CancelToken) {
        let control = self.control();
        (control.epoch, control.cancel.clone())
    }
}

/// Capture stage: validates frames and hands them to the worker.
///
/// Owned by the thread the sensor driver delivers frames on.
pub struct FrameCapture {
    intake: FrameIntake,
    shared: Arc<Shared>,
    events: EventSender,
}

impl FrameCapture {
    /// Validates a frame and offers it to the worker, replacing any frame
    /// the worker did not pick up yet.
    ///
    /// # Returns
    ///
    /// Whether the frame passed the intake and was queued.
    pub fn push(&mut self, depth: RawDepthFrame, color: Option<ColorFrame>) -> bool {
        let timestamp = depth.timestamp;
        match self.intake.accept(depth, color) {
            Ok(pair) => {
                let epoch = self.shared.control().epoch;
                self.shared.slot.push(Job { pair, epoch })
            }
            Err(reason) => {
                self.events.send(ScanEvent::Rejected { timestamp, reason });
                false
            }
        }
    }

    pub fn stats(&self) -> &IntakeStats {
        self.intake.stats()
    }
}

/// Single capture thread, single worker thread scanning pipeline.
///
/// The worker owns the [`Session`] and is the only writer of the volume;
/// other threads read it through [`ScanPipeline::shared_volume`] and the
/// latest pose through [`ScanPipeline::pose_cell`].
pub struct ScanPipeline {
    shared: Arc<Shared>,
    capture: FrameCapture,
    intake_params: IntakeParams,
    calibration: CameraIntrinsics,
    volume: Arc<RwLock<Volume>>,
    events: Receiver<ScanEvent>,
    event_sender: EventSender,
    worker: Option<JoinHandle<Session>>,
}

impl ScanPipeline {
    /// Starts the worker thread on a session.
    pub fn start(session: Session) -> Result<Self> {
        let shared = Arc::new(Shared {
            slot: FrameSlot::new(),
            control: Mutex::new(Control {
                epoch: 0,
                cancel: CancelToken::new(),
            }),
            pose: Arc::new(PoseCell::new()),
        });
        let (event_sender, events) = EventSender::channel(EVENT_CAPACITY);
        let intake_params = session.config().intake.clone();
        let calibration = session.calibration().clone();
        let volume = session.shared_volume();

        let worker = {
            let shared = shared.clone();
            let events = event_sender.clone();
            thread::Builder::new()
                .name("scan-worker".to_string())
                .spawn(move || run_worker(session, &shared, &events))?
        };
        info!("scan pipeline started");

        Ok(Self {
            capture: FrameCapture {
                intake: FrameIntake::new(intake_params.clone()).with_calibration(calibration.clone()),
                shared: shared.clone(),
                events: event_sender.clone(),
            },
            shared,
            intake_params,
            calibration,
            volume,
            events,
            event_sender,
            worker: Some(worker),
        })
    }

    /// A new capture stage, for delivering frames from another thread.
    pub fn capture(&self) -> FrameCapture {
        FrameCapture {
            intake: FrameIntake::new(self.intake_params.clone())
                .with_calibration(self.calibration.clone()),
            shared: self.shared.clone(),
            events: self.event_sender.clone(),
        }
    }

    /// Pushes a frame through the pipeline's own capture stage.
    pub fn push_frame(&mut self, depth: RawDepthFrame, color: Option<ColorFrame>) -> bool {
        self.capture.push(depth, color)
    }

    /// Runs a capture thread that streams `source` until it is exhausted.
    ///
    /// # Arguments
    ///
    /// * `period` - Pause between frames, `None` to stream as fast as possible.
    ///
    /// # Returns
    ///
    /// The thread handle, which yields the number of frames read.
    pub fn spawn_source<S>(&self, mut source: S, period: Option<Duration>) -> Result<JoinHandle<Result<usize>>>
    where
        S: FrameSource + 'static,
    {
        let mut capture = self.capture();
        let handle = thread::Builder::new()
            .name("scan-capture".to_string())
            .spawn(move || {
                let mut count = 0;
                while let Some(frame) = source.next_frame()? {
                    capture.push(frame.depth, frame.color);
                    count += 1;
                    if let Some(period) = period {
                        thread::sleep(period);
                    }
                }
                debug!(frames = count, "source exhausted");
                Ok(count)
            })?;
        Ok(handle)
    }

    pub fn calibration(&self) -> &CameraIntrinsics {
        &self.calibration
    }

    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    pub fn pose_cell(&self) -> Arc<PoseCell> {
        self.shared.pose.clone()
    }

    pub fn shared_volume(&self) -> Arc<RwLock<Volume>> {
        self.volume.clone()
    }

    /// Frames replaced in the slot before the worker took them.
    pub fn dropped_frames(&self) -> usize {
        self.shared.slot.dropped()
    }

    /// Events dropped because [`Self::events`] was not drained.
    pub fn dropped_events(&self) -> usize {
        self.event_sender.dropped()
    }

    /// Requests a session reset. The frame in flight is discarded and
    /// frames queued before the request are dropped.
    pub fn reset(&self) {
        {
            let mut control = self.shared.control();
            control.epoch += 1;
            control.cancel.cancel();
            control.cancel = CancelToken::new();
        }
        self.shared.slot.clear();
        info!("session reset requested");
    }

    /// Stops accepting frames, lets the worker drain the slot and returns the session.
    pub fn finish(mut self) -> Result<Session> {
        self.shared.slot.close();
        let worker = self
            .worker
            .take()
            .ok_or_else(|| Error::invalid_parameter("pipeline already finished"))?;
        match worker.join() {
            Ok(session) => {
                info!(
                    dropped = self.shared.slot.dropped(),
                    "scan pipeline finished"
                );
                Ok(session)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for ScanPipeline {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.slot.close();
            let _ = worker.join();
        }
    }
}

fn run_worker(mut session: Session, shared: &Shared, events: &EventSender) -> Session {
    let mut session_epoch = 0;
    loop {
        let job = shared.slot.take_timeout(WORKER_POLL);
        let (epoch, cancel) = shared.current();

        if epoch != session_epoch {
            if let Err(err) = session.reset() {
                warn!(%err, "session reset failed");
            }
            shared.pose.clear();
            session_epoch = epoch;
            events.send(ScanEvent::Reset);
        }

        let job = match job {
            Some(job) => job,
            None if shared.slot.is_closed() => match shared.slot.try_take() {
                Some(job) => job,
                None => break,
            },
            None => continue,
        };
        let timestamp = job.pair.timestamp();
        if job.epoch != epoch {
            events.send(ScanEvent::Discarded { timestamp });
            continue;
        }

        let event = match session.process_cancelable(&job.pair, &cancel) {
            Ok(FrameOutcome::Tracked(processed)) => {
                shared.pose.publish(&processed.tracked.pose, timestamp);
                ScanEvent::Tracked(processed)
            }
            Ok(FrameOutcome::Lost { timestamp, reason }) => ScanEvent::Lost { timestamp, reason },
            Ok(FrameOutcome::Rejected(reason)) => ScanEvent::Rejected { timestamp, reason },
            Err(Error::Canceled) => ScanEvent::Discarded { timestamp },
            Err(err) => {
                warn!(%err, timestamp, "frame processing failed");
                ScanEvent::Failed {
                    timestamp,
                    message: err.to_string(),
                }
            }
        };
        events.send(event);
    }
    session
}

/// Mesh extraction on a background thread. The volume stays read locked,
/// so immutable, until the mesh is ready.
pub struct MeshExtraction {
    handle: JoinHandle<Mesh>,
}

impl MeshExtraction {
    pub fn spawn(volume: Arc<RwLock<Volume>>, extractor: MarchingCubes) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("mesh-extraction".to_string())
            .spawn(move || {
                let volume = volume.read().unwrap_or_else(PoisonError::into_inner);
                extractor.extract(&volume)
            })?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn wait(self) -> Mesh {
        match self.handle.join() {
            Ok(mesh) => mesh,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScanConfig, VolumeParams};
    use crate::synthetic::{linear_trajectory, SyntheticScene, SyntheticSensor};
    use crate::unit_test::small_intrinsics;
    use crate::transform::Pose;
    use nalgebra::Vector3;
    use rstest::rstest;

    fn corner_session(intrinsics: &CameraIntrinsics) -> Session {
        let config = ScanConfig {
            volume: VolumeParams::default()
                .with_center([0.0, 0.0, 0.45])
                .with_size(1.0)
                .with_resolution(64),
            ..Default::default()
        };
        Session::new(config, intrinsics.clone()).unwrap()
    }

    fn corner_sensor(intrinsics: &CameraIntrinsics, count: usize) -> SyntheticSensor {
        SyntheticSensor::new(
            SyntheticScene::corner(),
            intrinsics.clone(),
            linear_trajectory(&Vector3::zeros(), &Vector3::new(0.005, 0.0, 0.0), count),
        )
    }

    fn wait_for(pipeline: &ScanPipeline, predicate: impl Fn(&ScanEvent) -> bool) {
        loop {
            match pipeline.events().recv_timeout(Duration::from_secs(10)) {
                Ok(event) if predicate(&event) => return,
                Ok(_) => continue,
                Err(err) => panic!("event not received: {}", err),
            }
        }
    }

    #[rstest]
    fn should_process_in_capture_order(small_intrinsics: CameraIntrinsics) {
        let pipeline = ScanPipeline::start(corner_session(&small_intrinsics)).unwrap();
        let capture = pipeline
            .spawn_source(corner_sensor(&small_intrinsics, 12), None)
            .unwrap();
        assert_eq!(capture.join().unwrap().unwrap(), 12);

        let pose_cell = pipeline.pose_cell();
        let volume = pipeline.shared_volume();
        let events: Vec<ScanEvent> = pipeline.events().try_iter().collect();
        let dropped = pipeline.dropped_frames();
        assert_eq!(pipeline.dropped_events(), 0);
        let session = pipeline.finish().unwrap();

        let tracked = session.trajectory().len();
        assert!(tracked >= 1);
        assert_eq!(tracked + session.stats().lost + dropped, 12);
        assert!(session.trajectory().is_monotonic());
        assert!(events
            .iter()
            .all(|event| !matches!(event, ScanEvent::Reset | ScanEvent::Failed { .. })));

        let (_, timestamp) = pose_cell.latest().unwrap();
        assert_eq!(Some(timestamp), session.trajectory().last().map(|(_, t)| t));

        let extraction = MeshExtraction::spawn(volume, MarchingCubes::default()).unwrap();
        assert!(!extraction.wait().is_empty());
    }

    #[test]
    fn full_event_queue_should_drop_events() {
        let (sender, events) = EventSender::channel(2);
        for index in 0..5 {
            sender.send(ScanEvent::Discarded {
                timestamp: index as f64,
            });
        }
        assert_eq!(sender.dropped(), 3);
        let received: Vec<ScanEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ScanEvent::Discarded { timestamp: 0.0 },
                ScanEvent::Discarded { timestamp: 1.0 }
            ]
        );

        drop(events);
        sender.send(ScanEvent::Reset);
        assert_eq!(sender.dropped(), 3);
    }

    #[rstest]
    fn reset_should_restart_session(small_intrinsics: CameraIntrinsics) {
        let mut pipeline = ScanPipeline::start(corner_session(&small_intrinsics)).unwrap();
        let sensor = corner_sensor(&small_intrinsics, 4);
        let frame = sensor.frame_at(0).unwrap();
        assert!(pipeline.push_frame(frame.depth, frame.color));
        wait_for(&pipeline, |event| matches!(event, ScanEvent::Tracked(_)));

        pipeline.reset();
        wait_for(&pipeline, |event| *event == ScanEvent::Reset);
        assert!(pipeline.pose_cell().latest().is_none());

        let frame = sensor.frame_at(1).unwrap();
        assert!(pipeline.push_frame(frame.depth, frame.color));
        let session = pipeline.finish().unwrap();
        assert_eq!(session.stats().resets, 1);
        assert_eq!(session.trajectory().len(), 1);
        assert_eq!(session.trajectory()[0], Pose::eye());
    }
}
