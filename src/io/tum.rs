use std::io::BufRead;
use std::path::{Path, PathBuf};

use nalgebra::{Quaternion, Vector3};
use ndarray::{Array2, Array3};
use tracing::info;

use crate::camera::CameraIntrinsics;
use crate::error::{Error, Result};
use crate::frame::{ColorFrame, RawDepth, RawDepthFrame};
use crate::source::{FrameSource, SourceFrame};
use crate::trajectory::Trajectory;
use crate::transform::Pose;

/// Depth PNG units per meter.
const DEPTH_SCALE: f32 = 1.0 / 5000.0;
/// Largest time difference, in seconds, of two associated entries.
const MAX_ASSOCIATION_GAP: f64 = 0.02;

fn read_file_list(filepath: &Path) -> Result<Vec<(f64, String)>> {
    let reader = std::io::BufReader::new(std::fs::File::open(filepath)?);
    let mut file_list = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split(&[',', '\t', ' ']).filter(|t| !t.is_empty());
        let (time, path) = match (tokens.next(), tokens.next()) {
            (Some(time), Some(path)) => (time, path),
            _ => return Err(Error::Parser(format!("malformed list entry: {}", line))),
        };
        let time = time
            .parse::<f64>()
            .map_err(|err| Error::Parser(format!("bad timestamp {}: {}", time, err)))?;
        file_list.push((time, path.to_string()));
    }

    Ok(file_list)
}

fn associate<T1: Clone, T2: Clone>(
    first_list: &[(f64, T1)],
    second_list: &[(f64, T2)],
) -> Vec<(f64, T1, f64, T2)> {
    let mut first_list = first_list.iter().peekable();
    let mut second_list = second_list.iter().peekable();
    let mut result = Vec::<(f64, T1, f64, T2)>::new();
    while let (Some((first_time, first_value)), Some((second_time, second_value))) =
        (first_list.peek(), second_list.peek())
    {
        if (first_time - second_time).abs() < MAX_ASSOCIATION_GAP {
            result.push((
                *first_time,
                first_value.clone(),
                *second_time,
                second_value.clone(),
            ));
            first_list.next();
            second_list.next();
        } else if first_time < second_time {
            first_list.next();
        } else {
            second_list.next();
        }
    }

    result
}

fn load_trajectory(filepath: &Path) -> Result<Vec<(f64, Pose)>> {
    let reader = std::io::BufReader::new(std::fs::File::open(filepath)?);
    let mut trajectory = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() || line.trim().starts_with('#') {
            continue;
        }
        let tokens = line
            .split_whitespace()
            .map(|token| token.parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|err| Error::Parser(format!("bad trajectory line {}: {}", line, err)))?;
        if tokens.len() != 8 {
            return Err(Error::Parser(format!("bad trajectory line {}", line)));
        }
        trajectory.push((
            tokens[0],
            Pose::new(
                &Vector3::new(tokens[1] as f32, tokens[2] as f32, tokens[3] as f32),
                &Quaternion::new(
                    tokens[7] as f32,
                    tokens[4] as f32,
                    tokens[5] as f32,
                    tokens[6] as f32,
                ),
            ),
        ));
    }

    Ok(trajectory)
}

struct TumEntry {
    timestamp: f64,
    depth: String,
    rgb: Option<String>,
    ground_truth: Option<Pose>,
}

/// Recorded RGB-D sequence in the TUM layout.
///
/// The directory holds `depth.txt` and optionally `rgb.txt` and
/// `groundtruth.txt`. Depth images are 16 bit PNG in units of 1/5000 m.
pub struct TumSource {
    base_dir: PathBuf,
    intrinsics: CameraIntrinsics,
    entries: Vec<TumEntry>,
    index: usize,
}

impl TumSource {
    /// Intrinsics of the TUM default calibration.
    pub fn default_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::new(525.0, 525.0, 319.5, 239.5, 640, 480)
    }

    pub fn load<P: AsRef<Path>>(base_dirpath: P) -> Result<Self> {
        let base_dir = base_dirpath.as_ref().to_path_buf();
        let depth_files = read_file_list(&base_dir.join("depth.txt"))?;

        let rgb_path = base_dir.join("rgb.txt");
        let rgb_files = if rgb_path.exists() {
            Some(read_file_list(&rgb_path)?)
        } else {
            None
        };
        let ground_truth_path = base_dir.join("groundtruth.txt");
        let ground_truth = if ground_truth_path.exists() {
            Some(load_trajectory(&ground_truth_path)?)
        } else {
            None
        };

        let mut entries: Vec<TumEntry> = match &rgb_files {
            Some(rgb_files) => associate(&depth_files, rgb_files)
                .into_iter()
                .map(|(timestamp, depth, _, rgb)| TumEntry {
                    timestamp,
                    depth,
                    rgb: Some(rgb),
                    ground_truth: None,
                })
                .collect(),
            None => depth_files
                .into_iter()
                .map(|(timestamp, depth)| TumEntry {
                    timestamp,
                    depth,
                    rgb: None,
                    ground_truth: None,
                })
                .collect(),
        };

        if let Some(ground_truth) = ground_truth {
            let times: Vec<(f64, usize)> = entries
                .iter()
                .enumerate()
                .map(|(i, entry)| (entry.timestamp, i))
                .collect();
            for (_, i, _, pose) in associate(&times, &ground_truth) {
                entries[i].ground_truth = Some(pose);
            }
        }

        info!(frames = entries.len(), dir = %base_dir.display(), "TUM sequence loaded");
        Ok(Self {
            base_dir,
            intrinsics: Self::default_intrinsics(),
            entries,
            index: 0,
        })
    }

    pub fn with_intrinsics(mut self, intrinsics: CameraIntrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ground truth poses of the frames that have one.
    pub fn ground_truth(&self) -> Trajectory {
        self.entries
            .iter()
            .filter_map(|entry| entry.ground_truth.map(|pose| (pose, entry.timestamp)))
            .collect()
    }

    pub fn get(&self, index: usize) -> Result<SourceFrame> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::invalid_parameter(format!("frame {} out of range", index)))?;

        let depth_image = image::open(self.base_dir.join(&entry.depth))?.into_luma16();
        let (width, height) = depth_image.dimensions();
        let depth = Array2::from_shape_vec((height as usize, width as usize), depth_image.into_raw())
            .map_err(|err| Error::Parser(err.to_string()))?;

        let color = match &entry.rgb {
            Some(rgb) => {
                let rgb_image = image::open(self.base_dir.join(rgb))?.into_rgb8();
                let (width, height) = rgb_image.dimensions();
                let image = Array3::from_shape_vec(
                    (height as usize, width as usize, 3),
                    rgb_image.into_raw(),
                )
                .map_err(|err| Error::Parser(err.to_string()))?;
                Some(ColorFrame::new(image, entry.timestamp, self.intrinsics.clone()))
            }
            None => None,
        };

        Ok(SourceFrame {
            depth: RawDepthFrame {
                depth: RawDepth::Scaled {
                    data: depth,
                    scale: DEPTH_SCALE,
                },
                timestamp: entry.timestamp,
                intrinsics: self.intrinsics.clone(),
            },
            color,
            ground_truth: entry.ground_truth,
        })
    }
}

impl FrameSource for TumSource {
    fn calibration(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        if self.index >= self.entries.len() {
            return Ok(None);
        }
        let frame = self.get(self.index)?;
        self.index += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.index = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    fn write_sequence(dir: &Path) {
        std::fs::create_dir_all(dir.join("depth")).unwrap();
        std::fs::create_dir_all(dir.join("rgb")).unwrap();
        let mut depth_list = String::from("# depth maps\n");
        let mut rgb_list = String::from("# color images\n");
        for i in 0..3 {
            let time = 100.0 + i as f64 / 30.0;
            let depth = ImageBuffer::<Luma<u16>, Vec<u16>>::from_fn(8, 6, |x, _| {
                Luma([if x == 0 { 0 } else { 2500 }])
            });
            depth.save(dir.join(format!("depth/{i}.png"))).unwrap();
            let rgb = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(8, 6, Rgb([10, 20, 30]));
            rgb.save(dir.join(format!("rgb/{i}.png"))).unwrap();
            depth_list.push_str(&format!("{time:.6} depth/{i}.png\n"));
            rgb_list.push_str(&format!("{:.6} rgb/{i}.png\n", time + 0.005));
        }
        std::fs::write(dir.join("depth.txt"), depth_list).unwrap();
        std::fs::write(dir.join("rgb.txt"), rgb_list).unwrap();
        std::fs::write(
            dir.join("groundtruth.txt"),
            "# timestamp tx ty tz qx qy qz qw\n100.0 0.1 0.0 0.0 0 0 0 1\n",
        )
        .unwrap();
    }

    #[test]
    fn should_stream_recorded_sequence() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());

        let mut source = TumSource::load(dir.path())
            .unwrap()
            .with_intrinsics(CameraIntrinsics::new(8.0, 8.0, 4.0, 3.0, 8, 6));
        assert_eq!(source.len(), 3);
        assert_eq!(source.ground_truth().len(), 1);

        let frame = source.next_frame().unwrap().unwrap();
        let meters = frame.depth.depth.to_meters();
        assert!(meters[(0, 0)].is_nan());
        assert!((meters[(2, 3)] - 0.5).abs() < 1e-6);
        let color = frame.color.unwrap();
        assert_eq!(color.rgb(1, 1), [10, 20, 30]);
        assert!(frame.ground_truth.is_some());

        let mut count = 1;
        while source.next_frame().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn should_fail_without_lists() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TumSource::load(dir.path()).is_err());
    }
}
