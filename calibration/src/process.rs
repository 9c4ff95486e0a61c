use anyhow::{Context, Result};
use camcalib_common::{
    calibrate::accumulate,
    cv::{self, BoardDetector},
    images::discover_images,
    BoardSpec, CameraParameters,
};
use std::path::Path;

pub fn process(
    dir: &Path,
    ext: &str,
    board: Option<&Path>,
    output: &Path,
    display: bool,
) -> Result<()> {
    let spec = BoardSpec::load_or_default(board).context("loading board geometry")?;
    let board = cv::generate_board(&spec)?;
    let detector = BoardDetector::new(&board, spec.dictionary)?;
    log::debug!(
        "{}x{} board, up to {} corners per view",
        spec.squares_x,
        spec.squares_y,
        spec.max_corners()
    );

    let images = discover_images(dir, ext)?;

    log::info!("detecting board corners");
    let views = accumulate(&images, |p| detector.detect_view(p))?;

    let params = cv::calibrate(&board, &views)?;
    log::info!(
        "focal length {:.2?}, principal point {:.2?}, {} distortion coefficients",
        params.focal_length(),
        params.principal_point(),
        params.dist_coeffs.len()
    );

    log::info!("saving parameters to `{}`", output.display());
    params
        .save(output)
        .with_context(|| format!("saving camera parameters to `{}`", output.display()))?;

    if display {
        log::info!("loading parameters from `{}`", output.display());
        let params = CameraParameters::load(output)?;
        cv::show_undistorted(&images, &params)?;
    }

    Ok(())
}
