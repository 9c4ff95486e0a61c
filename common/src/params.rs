use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    mem::size_of,
    path::Path,
};

use crate::{Error, Result};

/// Distortion vector lengths OpenCV knows how to interpret.
pub const DIST_COEFF_COUNTS: [usize; 5] = [4, 5, 8, 12, 14];

/// Result of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    /// Row-major 3x3 intrinsic matrix
    pub camera_matrix: [[f64; 3]; 3],
    /// 4, 5, 8, 12 or 14 coefficients
    pub dist_coeffs: Vec<f64>,
    /// (width, height) the parameters were computed for
    pub image_size: (u32, u32),
    /// RMS reprojection error reported by the solver
    pub rms_error: f64,
}

/// On-disk encoding, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsFormat {
    Json,
    Binary,
}

impl ParamsFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(e) if e.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Binary,
        }
    }
}

impl CameraParameters {
    pub fn validate(&self) -> Result<()> {
        if !DIST_COEFF_COUNTS.contains(&self.dist_coeffs.len()) {
            return Err(Error::InvalidParameters(format!(
                "{} distortion coefficients",
                self.dist_coeffs.len()
            )));
        }

        if self
            .camera_matrix
            .iter()
            .flatten()
            .chain(&self.dist_coeffs)
            .chain([&self.rms_error])
            .any(|v| !v.is_finite())
        {
            return Err(Error::InvalidParameters("non-finite value".into()));
        }

        Ok(())
    }

    pub fn focal_length(&self) -> (f64, f64) {
        (self.camera_matrix[0][0], self.camera_matrix[1][1])
    }

    pub fn principal_point(&self) -> (f64, f64) {
        (self.camera_matrix[0][2], self.camera_matrix[1][2])
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;

        let mut w = BufWriter::new(File::create(path)?);
        match ParamsFormat::from_path(path) {
            ParamsFormat::Json => serde_json::to_writer_pretty(&mut w, self)?,
            ParamsFormat::Binary => w.write_all(&self.to_be_bytes())?,
        }
        w.flush()?;

        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut r = BufReader::new(File::open(path)?);

        let params: Self = match ParamsFormat::from_path(path) {
            ParamsFormat::Json => serde_json::from_reader(r)?,
            ParamsFormat::Binary => Self::from_be_bytes(&mut r)?,
        };
        params.validate()?;

        Ok(params)
    }

    pub fn to_be_bytes(&self) -> Vec<u8> {
        let dist_coeffs_len = (self.dist_coeffs.len() as u8).to_be_bytes().into_iter();

        let camera_matrix = self
            .camera_matrix
            .iter()
            .flatten()
            .copied()
            .flat_map(f64::to_be_bytes);

        let dist_coeffs = self.dist_coeffs.iter().copied().flat_map(f64::to_be_bytes);

        let (w, h) = self.image_size;
        let image_size = w.to_be_bytes().into_iter().chain(h.to_be_bytes());

        let rms_error = self.rms_error.to_be_bytes().into_iter();

        dist_coeffs_len
            .chain(camera_matrix)
            .chain(dist_coeffs)
            .chain(image_size)
            .chain(rms_error)
            .collect()
    }

    pub fn from_be_bytes(r: &mut impl Read) -> Result<Self> {
        let mut count = [0; 1];
        r.read_exact(&mut count)?;
        let coeff_count = count[0] as usize;

        if !DIST_COEFF_COUNTS.contains(&coeff_count) {
            return Err(Error::InvalidParameters(format!(
                "{coeff_count} distortion coefficients"
            )));
        }

        let mut read_f64 = || -> Result<f64> {
            let mut buf = [0; size_of::<f64>()];
            r.read_exact(&mut buf)?;
            Ok(f64::from_be_bytes(buf))
        };

        let mut camera_matrix = [[0.; 3]; 3];
        for v in camera_matrix.iter_mut().flatten() {
            *v = read_f64()?;
        }

        let dist_coeffs = (0..coeff_count)
            .map(|_| read_f64())
            .collect::<Result<Vec<_>>>()?;

        let mut size = [0; 2 * size_of::<u32>()];
        r.read_exact(&mut size)?;
        let (w, h) = size.split_at(size_of::<u32>());
        let image_size = (
            u32::from_be_bytes(w.try_into().map_err(|_| bad_size())?),
            u32::from_be_bytes(h.try_into().map_err(|_| bad_size())?),
        );

        let mut rms = [0; size_of::<f64>()];
        r.read_exact(&mut rms)?;
        let rms_error = f64::from_be_bytes(rms);

        Ok(Self {
            camera_matrix,
            dist_coeffs,
            image_size,
            rms_error,
        })
    }
}

fn bad_size() -> Error {
    Error::InvalidParameters("truncated image size".into())
}
