pub mod board;
pub mod calibrate;
pub mod capture;
pub mod images;
pub mod params;

#[cfg(feature = "cv")]
pub mod cv;

use std::path::PathBuf;
use thiserror::Error as ThisError;

pub use board::{BoardSpec, Dictionary};
pub use params::CameraParameters;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "cv")]
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("output file `{}` already exists", .0.display())]
    OutputExists(PathBuf),

    #[error("could not open video source `{0}`")]
    SourceUnavailable(String),

    #[error("failed to read frame {0}")]
    FrameRead(u64),

    #[error("no `.{ext}` images in `{}`", dir.display())]
    NoImages { dir: PathBuf, ext: String },

    #[error("none of the {0} images had enough detected corners")]
    NotEnoughDetections(usize),

    #[error("invalid camera parameters: {0}")]
    InvalidParameters(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
