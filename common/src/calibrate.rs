//! Bookkeeping around the ChArUco calibration solve: which views are usable
//! and what the solver starts from. The detection and the solve itself live
//! in [`crate::cv`].

use std::{collections::BTreeMap, fmt, path::Path};

use crate::{Error, Result};

/// Views with fewer interpolated ChArUco corners are not used.
pub const MIN_CORNERS: usize = 4;

/// Focal length (px) the solver starts from.
pub const INITIAL_FOCAL_LENGTH: f64 = 1000.;

/// Interpolated ChArUco corners of one view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub corners: Vec<(f32, f32)>,
    pub ids: Vec<i32>,
}

impl Detection {
    pub fn len(&self) -> usize {
        self.corners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corners.is_empty()
    }
}

/// What the detector saw in one image.
#[derive(Debug, Clone)]
pub struct View {
    pub image_size: (u32, u32),
    pub detection: Detection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Unreadable,
    DetectionFailed,
    TooFewCorners(usize),
    IdMismatch,
    SizeMismatch { expected: (u32, u32), got: (u32, u32) },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable => write!(f, "could not be read"),
            Self::DetectionFailed => write!(f, "detection failed"),
            Self::TooFewCorners(n) => write!(f, "only {n} corners (need {MIN_CORNERS})"),
            Self::IdMismatch => write!(f, "corner and id counts differ"),
            Self::SizeMismatch { expected, got } => write!(
                f,
                "size {}x{} differs from {}x{}",
                got.0, got.1, expected.0, expected.1
            ),
        }
    }
}

/// Detections keyed by image index. The image size is fixed by the first
/// accepted view.
#[derive(Debug, Default)]
pub struct CornerAccumulator {
    views: BTreeMap<usize, Detection>,
    image_size: Option<(u32, u32)>,
    skipped: Vec<(usize, SkipReason)>,
}

impl CornerAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, index: usize, view: Option<View>) -> Result<(), SkipReason> {
        let checked = match &view {
            Some(v) => self.check(v),
            None => Err(SkipReason::Unreadable),
        };

        if let Err(reason) = checked {
            self.skipped.push((index, reason));
            return Err(reason);
        }

        if let Some(v) = view {
            self.image_size.get_or_insert(v.image_size);
            self.views.insert(index, v.detection);
        }

        Ok(())
    }

    fn check(&self, view: &View) -> Result<(), SkipReason> {
        if let Some(expected) = self.image_size {
            if expected != view.image_size {
                return Err(SkipReason::SizeMismatch {
                    expected,
                    got: view.image_size,
                });
            }
        }

        let d = &view.detection;
        if d.corners.len() != d.ids.len() {
            return Err(SkipReason::IdMismatch);
        }
        if d.len() < MIN_CORNERS {
            return Err(SkipReason::TooFewCorners(d.len()));
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn image_size(&self) -> Option<(u32, u32)> {
        self.image_size
    }

    pub fn skipped(&self) -> &[(usize, SkipReason)] {
        &self.skipped
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.views.keys().copied()
    }

    pub fn views(&self) -> impl Iterator<Item = &Detection> {
        self.views.values()
    }
}

/// Runs `detect` over every image and keeps the usable views. A detector
/// error only skips the image it happened on.
pub fn accumulate<P, F>(images: &[P], mut detect: F) -> Result<CornerAccumulator>
where
    P: AsRef<Path>,
    F: FnMut(&Path) -> Result<Option<View>>,
{
    let mut acc = CornerAccumulator::new();

    for (i, image) in images.iter().enumerate() {
        let image = image.as_ref();
        let res = match detect(image) {
            Ok(view) => acc.add(i, view),
            Err(e) => {
                log::error!("{}: {e}", image.display());
                acc.skipped.push((i, SkipReason::DetectionFailed));
                Err(SkipReason::DetectionFailed)
            }
        };

        match res {
            Ok(()) => log::debug!("{}: accepted", image.display()),
            Err(reason) => log::warn!("skipping {}: {reason}", image.display()),
        }
    }

    log::info!(
        "{} of {} images usable for calibration",
        acc.len(),
        images.len()
    );

    if acc.is_empty() {
        return Err(Error::NotEnoughDetections(images.len()));
    }

    Ok(acc)
}

/// Starting intrinsics: fixed focal length, principal point at the centre.
pub fn initial_camera_matrix((width, height): (u32, u32)) -> [[f64; 3]; 3] {
    [
        [INITIAL_FOCAL_LENGTH, 0., width as f64 / 2.],
        [0., INITIAL_FOCAL_LENGTH, height as f64 / 2.],
        [0., 0., 1.],
    ]
}
