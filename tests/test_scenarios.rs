use nalgebra::Vector3;
use ndarray::Array2;

use scanfuse::{
    camera::CameraIntrinsics,
    config::{ScanConfig, VolumeParams},
    frame::RawDepthFrame,
    marching_cubes::MarchingCubes,
    session::{FrameOutcome, Session},
    synthetic::{linear_trajectory, SyntheticScene, SyntheticSensor},
    tracker::{LostReason, TrackerState},
    transform::Pose,
};

const FRAME_PERIOD: f64 = 1.0 / 30.0;

fn wedge_frame(intrinsics: &CameraIntrinsics, pose: &Pose, index: usize) -> RawDepthFrame {
    let (depth, _) = SyntheticScene::wedge().render(intrinsics, pose);
    RawDepthFrame::metric(depth, index as f64 * FRAME_PERIOD, intrinsics.clone())
}

#[test]
fn single_frame_plane() {
    let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0, 640, 480);
    let mut session = Session::new(ScanConfig::default(), intrinsics.clone()).unwrap();

    let depth = RawDepthFrame::metric(Array2::from_elem((480, 640), 0.5), 0.0, intrinsics);
    let outcome = session.process(depth, None).unwrap();
    let processed = outcome.tracked().unwrap();
    assert!(processed.tracked.first_frame);
    assert_eq!(processed.tracked.pose, Pose::eye());
    assert_eq!(processed.tracked.quality, 1.0);

    let volume = session.read_volume();
    let voxel_size = volume.voxel_size();
    let [di, dj, dk] = volume.dims();
    let mut checked = 0;
    for i in 0..di {
        for j in 0..dj {
            // Voxel closest to the plane along the column.
            let nearest = (0..dk)
                .filter(|k| volume.voxel(i, j, *k).1 > 0.0)
                .min_by(|a, b| {
                    let za = (volume.grid().voxel_center(i, j, *a)[2] - 0.5).abs();
                    let zb = (volume.grid().voxel_center(i, j, *b)[2] - 0.5).abs();
                    za.total_cmp(&zb)
                });
            if let Some(k) = nearest {
                if (volume.grid().voxel_center(i, j, k)[2] - 0.5).abs() < voxel_size {
                    assert!(volume.voxel(i, j, k).0.abs() <= voxel_size);
                    checked += 1;
                }
            }
        }
    }
    assert!(checked > 1000);

    let mesh = MarchingCubes::default().extract(&volume);
    assert!(!mesh.is_empty());
    for v in 0..mesh.len_vertices() {
        let z = mesh.vertex(v)[2];
        assert!((z - 0.5).abs() < 2e-3, "vertex {} at z = {}", v, z);
    }
}

#[test]
fn two_frames_translation() {
    let intrinsics = CameraIntrinsics::new(160.0, 160.0, 79.5, 59.5, 160, 120);
    let mut session = Session::new(ScanConfig::default(), intrinsics.clone()).unwrap();

    let first = session
        .process(wedge_frame(&intrinsics, &Pose::eye(), 0), None)
        .unwrap();
    assert!(first.tracked().is_some());

    let moved = Pose::from_translation(&Vector3::new(0.05, 0.0, 0.0));
    let second = session
        .process(wedge_frame(&intrinsics, &moved, 1), None)
        .unwrap();
    let tracked = second.tracked().expect("second frame should track").tracked;
    let translation = tracked.pose.translation();
    assert!((translation - Vector3::new(0.05, 0.0, 0.0)).norm() < 2e-3, "{:?}", translation);
}

#[test]
fn tracking_loss() {
    let intrinsics = CameraIntrinsics::new(80.0, 80.0, 40.0, 30.0, 80, 60);
    let mut session = Session::new(ScanConfig::default(), intrinsics.clone()).unwrap();
    let moved = Pose::from_translation(&Vector3::new(0.01, 0.0, 0.0));
    session
        .process(wedge_frame(&intrinsics, &Pose::eye(), 0), None)
        .unwrap();
    session
        .process(wedge_frame(&intrinsics, &moved, 1), None)
        .unwrap();
    assert_eq!(session.stats().integrated, 2);
    let weights_before = session.read_volume().weights().clone();

    let jumped = {
        let (depth, _) = SyntheticScene::wedge().render(&intrinsics, &moved);
        RawDepthFrame::metric(depth.mapv(|z| z + 1.0), 2.0 * FRAME_PERIOD, intrinsics.clone())
    };
    let outcome = session.process(jumped, None).unwrap();
    assert!(
        matches!(outcome, FrameOutcome::Lost { .. }),
        "{:?}",
        outcome
    );
    assert_eq!(session.tracker().state(), TrackerState::Lost);
    assert_eq!(session.stats().integrated, 2);
    assert_eq!(*session.read_volume().weights(), weights_before);
    assert!(session.user_message().is_some());

    // Back in view, the tracker relocalizes.
    let outcome = session
        .process(wedge_frame(&intrinsics, &moved, 3), None)
        .unwrap();
    let tracked = outcome.tracked().expect("should relocalize").tracked;
    assert!(tracked.relocalized);
    assert_eq!(session.stats().integrated, 3);
}

#[test]
fn volume_recentering() {
    let intrinsics = CameraIntrinsics::new(80.0, 80.0, 40.0, 30.0, 80, 60);
    let config = ScanConfig {
        volume: VolumeParams::default()
            .with_center([0.0, 0.0, 0.45])
            .with_size(1.0)
            .with_resolution(80),
        ..Default::default()
    };
    let mut session = Session::new(config, intrinsics.clone()).unwrap();
    let poses = linear_trajectory(&Vector3::zeros(), &Vector3::new(0.01, 0.0, 0.0), 40);

    let mut recenters = Vec::new();
    for (index, pose) in poses.iter().enumerate() {
        let before = session.read_volume().clone();
        let outcome = session
            .process_with_pose(wedge_frame(&intrinsics, pose, index), None, pose)
            .unwrap();
        let processed = outcome.tracked().expect("known poses are accepted");
        assert!(processed.fusion.is_some());

        if let Some(recenter) = &processed.recenter {
            let voxel_size = before.voxel_size();
            let shift = recenter.shift;
            let expected = before.center()
                + Vector3::new(shift[0] as f32, shift[1] as f32, shift[2] as f32) * voxel_size;
            assert!((recenter.new_center - expected).norm() < 1e-4);
            assert!(shift[0] > 0);

            // Surviving voxels keep at least their weight.
            let after = session.read_volume();
            let [di, dj, dk] = before.dims();
            let mut survived = 0;
            for i in 0..di {
                for j in 0..dj {
                    for k in 0..dk {
                        let weight = before.voxel(i, j, k).1;
                        if weight <= 0.0 {
                            continue;
                        }
                        let (ni, nj, nk) = (
                            i as i64 - shift[0],
                            j as i64 - shift[1],
                            k as i64 - shift[2],
                        );
                        if ni < 0 || nj < 0 || nk < 0 || ni >= di as i64 || nj >= dj as i64 || nk >= dk as i64 {
                            continue;
                        }
                        assert!(after.voxel(ni as usize, nj as usize, nk as usize).1 >= weight - 1e-4);
                        survived += 1;
                    }
                }
            }
            assert!(survived > 0);
            recenters.push(recenter.clone());
        }
    }

    assert_eq!(recenters.len(), 1);
    assert!(!session.volume_exceeded());
    assert_eq!(session.stats().recentered, 1);
}

#[test]
fn outside_pose_is_lost() {
    let intrinsics = CameraIntrinsics::new(80.0, 80.0, 40.0, 30.0, 80, 60);
    let mut session = Session::new(ScanConfig::default(), intrinsics.clone()).unwrap();
    let outside = Pose::from_translation(&Vector3::new(5.0, 0.0, 0.0));
    let outcome = session
        .process_with_pose(wedge_frame(&intrinsics, &outside, 0), None, &outside)
        .unwrap();
    assert_eq!(
        outcome,
        FrameOutcome::Lost {
            timestamp: 0.0,
            reason: LostReason::OutsideVolume
        }
    );
    assert!(session.read_volume().is_empty());
}

#[test]
fn reset_then_empty_stream_leaves_volume_zeroed() {
    let intrinsics = CameraIntrinsics::new(80.0, 80.0, 40.0, 30.0, 80, 60);
    let mut session = Session::new(ScanConfig::default(), intrinsics.clone()).unwrap();
    let mut sensor = SyntheticSensor::new(
        SyntheticScene::wedge(),
        intrinsics,
        linear_trajectory(&Vector3::zeros(), &Vector3::new(0.005, 0.0, 0.0), 3),
    );
    while let Some(frame) = scanfuse::source::FrameSource::next_frame(&mut sensor).unwrap() {
        session.process(frame.depth, frame.color).unwrap();
    }
    assert!(!session.read_volume().is_empty());

    session.reset().unwrap();
    let volume = session.read_volume();
    assert!(volume.is_empty());
    assert!(volume.weights().iter().all(|w| *w == 0.0));
    assert!(MarchingCubes::default().extract(&volume).is_empty());
}
