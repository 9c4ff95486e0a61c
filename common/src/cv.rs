use std::{
    io,
    path::{Path, PathBuf},
};

use opencv::{
    aruco::calibrate_camera_charuco_extended,
    calib3d, core, highgui, imgcodecs, imgproc,
    objdetect::{self, CharucoBoard, CharucoDetector, CharucoParameters},
    prelude::*,
    types,
    videoio::{self, VideoCapture},
};

use crate::{
    board::{BoardSpec, Dictionary},
    calibrate::{initial_camera_matrix, CornerAccumulator, Detection, View},
    capture::{FrameSource, FrameWriter, VideoSource, Viewer},
    CameraParameters, Error,
};

/// Sub-pixel refinement window (half size) for marker corners.
const SUBPIX_WINDOW: i32 = 3;
const SUBPIX_MAX_ITER: i32 = 100;
const SUBPIX_EPS: f64 = 1e-5;

const SOLVER_MAX_ITER: i32 = 10_000;
const SOLVER_EPS: f64 = 1e-9;

/// Stacked preview shows at most this many image pairs.
const PREVIEW_PAIRS: usize = 5;

pub fn get_aruco_dictionary(dictionary: Dictionary) -> opencv::Result<objdetect::Dictionary> {
    use objdetect::PredefinedDictionaryType as D;

    objdetect::get_predefined_dictionary(match dictionary {
        Dictionary::Dict4x4_50 => D::DICT_4X4_50,
        Dictionary::Dict4x4_250 => D::DICT_4X4_250,
        Dictionary::Dict5x5_100 => D::DICT_5X5_100,
        Dictionary::Dict5x5_250 => D::DICT_5X5_250,
        Dictionary::Dict6x6_250 => D::DICT_6X6_250,
        Dictionary::Dict7x7_250 => D::DICT_7X7_250,
    })
}

pub fn generate_board(spec: &BoardSpec) -> opencv::Result<CharucoBoard> {
    CharucoBoard::new(
        core::Size::new(spec.squares_x as i32, spec.squares_y as i32),
        spec.square_length,
        spec.marker_length,
        &get_aruco_dictionary(spec.dictionary)?,
        &core::no_array(),
    )
}

pub fn export_board(
    board: &CharucoBoard,
    path: &Path,
    size: core::Size,
    margin: i32,
) -> crate::Result<()> {
    let mut img = Mat::default();
    board.generate_image(size, &mut img, margin, 1)?;
    write_image(path, &img)
}

fn path_str(path: &Path) -> crate::Result<&str> {
    path.to_str().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("non UTF-8 path `{}`", path.display()),
        ))
    })
}

fn write_image(path: &Path, image: &Mat) -> crate::Result<()> {
    if !imgcodecs::imwrite(path_str(path)?, image, &core::Vector::<i32>::default())? {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("could not encode `{}`", path.display()),
        )));
    }
    Ok(())
}

/// `None` if the file is missing or cannot be decoded.
pub fn read_image(path: &Path) -> crate::Result<Option<Mat>> {
    let img = imgcodecs::imread(path_str(path)?, imgcodecs::IMREAD_COLOR)?;
    if img.size()?.width < 1 {
        return Ok(None);
    }
    Ok(Some(img))
}

fn to_gray(image: &Mat) -> opencv::Result<Mat> {
    let code = match image.channels() {
        1 => return image.try_clone(),
        4 => imgproc::COLOR_BGRA2GRAY,
        _ => imgproc::COLOR_BGR2GRAY,
    };

    let mut gray = Mat::default();
    imgproc::cvt_color(image, &mut gray, code, 0)?;
    Ok(gray)
}

fn refine_parameters() -> objdetect::RefineParameters {
    objdetect::RefineParameters {
        min_rep_distance: 0.5,
        error_correction_rate: 1.0,
        check_all_orders: true,
    }
}

/// Marker and ChArUco detectors for one board.
pub struct BoardDetector {
    markers: objdetect::ArucoDetector,
    charuco: CharucoDetector,
    subpix_criteria: core::TermCriteria,
}

impl BoardDetector {
    pub fn new(board: &CharucoBoard, dictionary: Dictionary) -> opencv::Result<Self> {
        let markers = objdetect::ArucoDetector::new(
            &get_aruco_dictionary(dictionary)?,
            &objdetect::DetectorParameters::default()?,
            refine_parameters(),
        )?;

        let charuco = CharucoDetector::new(
            board,
            &CharucoParameters::default()?,
            &objdetect::DetectorParameters::default()?,
            refine_parameters(),
        )?;

        let subpix_criteria = core::TermCriteria::new(
            core::TermCriteria_EPS + core::TermCriteria_MAX_ITER,
            SUBPIX_MAX_ITER,
            SUBPIX_EPS,
        )?;

        Ok(Self {
            markers,
            charuco,
            subpix_criteria,
        })
    }

    /// Detects markers, optionally refines their corners to sub-pixel
    /// accuracy and interpolates the ChArUco corners from them.
    pub fn find_board(
        &self,
        image: &Mat,
        refine: bool,
        include_markers: bool,
    ) -> opencv::Result<Option<FoundBoard>> {
        let gray = to_gray(image)?;

        let mut marker_corners = types::VectorOfVectorOfPoint2f::new();
        let mut marker_ids = types::VectorOfi32::new();
        let mut corners = types::VectorOfPoint2f::new();
        let mut ids = types::VectorOfi32::new();

        self.markers.detect_markers(
            &gray,
            &mut marker_corners,
            &mut marker_ids,
            &mut core::no_array(),
        )?;

        // requires at least one detectable marker
        if marker_ids.is_empty() {
            return Ok(None);
        }

        if refine {
            for i in 0..marker_corners.len() {
                let mut quad = marker_corners.get(i)?;
                imgproc::corner_sub_pix(
                    &gray,
                    &mut quad,
                    core::Size::new(SUBPIX_WINDOW, SUBPIX_WINDOW),
                    core::Size::new(-1, -1),
                    self.subpix_criteria,
                )?;
                marker_corners.set(i, quad)?;
            }
        }

        self.charuco.detect_board(
            &gray,
            &mut corners,
            &mut ids,
            &mut marker_corners,
            &mut marker_ids,
        )?;

        if ids.is_empty() {
            return Ok(None);
        }

        let markers = if include_markers {
            Some(FoundMarkers {
                corners: marker_corners,
                ids: marker_ids,
            })
        } else {
            None
        };

        Ok(Some(FoundBoard {
            corners,
            ids,
            markers,
        }))
    }

    /// Loads `path` and detects the board in it, `None` if it can't be read.
    pub fn detect_view(&self, path: &Path) -> crate::Result<Option<View>> {
        let Some(img) = read_image(path)? else {
            return Ok(None);
        };
        let size = img.size()?;

        let detection = self
            .find_board(&img, true, false)?
            .map(|fb| fb.to_detection())
            .unwrap_or_default();

        Ok(Some(View {
            image_size: (size.width as u32, size.height as u32),
            detection,
        }))
    }
}

pub struct FoundBoard {
    corners: types::VectorOfPoint2f,
    ids: types::VectorOfi32,
    markers: Option<FoundMarkers>,
}

pub struct FoundMarkers {
    corners: types::VectorOfVectorOfPoint2f,
    ids: types::VectorOfi32,
}

impl FoundBoard {
    pub fn to_detection(&self) -> Detection {
        Detection {
            corners: self.corners.iter().map(|p| (p.x, p.y)).collect(),
            ids: self.ids.to_vec(),
        }
    }
}

pub fn draw_board(image: &mut Mat, board: &FoundBoard) -> opencv::Result<()> {
    objdetect::draw_detected_corners_charuco(
        image,
        &board.corners,
        &board.ids,
        core::Scalar::new(0.0, 0.0, 255.0, 1.0),
    )?;
    Ok(())
}

pub fn draw_charuco_board(image: &mut Mat, board: &FoundBoard) -> opencv::Result<()> {
    draw_board(image, board)?;
    if let Some(markers) = &board.markers {
        objdetect::draw_detected_markers(
            image,
            &markers.corners,
            &markers.ids,
            core::Scalar::new(0.0, 255.0, 0.0, 1.0),
        )?;
    }
    Ok(())
}

/// Solves for the intrinsics from the accumulated views, starting from
/// [`initial_camera_matrix`] with a fixed aspect ratio and the rational
/// distortion model.
pub fn calibrate(
    board: &CharucoBoard,
    views: &CornerAccumulator,
) -> crate::Result<CameraParameters> {
    let image_size = views
        .image_size()
        .ok_or(Error::NotEnoughDetections(views.skipped().len()))?;

    let mut charuco_corners = types::VectorOfVectorOfPoint2f::new();
    let mut charuco_ids = types::VectorOfVectorOfi32::new();
    for d in views.views() {
        charuco_corners.push(
            d.corners
                .iter()
                .map(|&(x, y)| core::Point2f::new(x, y))
                .collect(),
        );
        charuco_ids.push(d.ids.iter().copied().collect());
    }

    let mut camera_matrix = Mat::from_slice_2d(&initial_camera_matrix(image_size))?;
    let mut dist_coeffs = Mat::from_slice_2d(&[[0f64; 5]])?;
    let mut rvecs = types::VectorOfMat::new();
    let mut tvecs = types::VectorOfMat::new();
    let mut std_deviations_intrinsics = Mat::default();
    let mut std_deviations_extrinsics = Mat::default();
    let mut per_view_errors = Mat::default();

    let flags = calib3d::CALIB_USE_INTRINSIC_GUESS
        | calib3d::CALIB_RATIONAL_MODEL
        | calib3d::CALIB_FIX_ASPECT_RATIO;
    let criteria = core::TermCriteria::new(
        core::TermCriteria_COUNT + core::TermCriteria_EPS,
        SOLVER_MAX_ITER,
        SOLVER_EPS,
    )?;

    log::info!("calibrating from {} views", views.len());

    let board = types::PtrOfCharucoBoard::new(board.clone());
    let rms_error = calibrate_camera_charuco_extended(
        &charuco_corners,
        &charuco_ids,
        &board,
        core::Size::new(image_size.0 as i32, image_size.1 as i32),
        &mut camera_matrix,
        &mut dist_coeffs,
        &mut rvecs,
        &mut tvecs,
        &mut std_deviations_intrinsics,
        &mut std_deviations_extrinsics,
        &mut per_view_errors,
        flags,
        criteria,
    )?;

    log::info!("calibration finished, estimated error: {rms_error:.3}");

    for (i, (_, e)) in views.indices().zip(per_view_errors.iter::<f64>()?) {
        log::debug!("view {i}: error {e:.3}");
    }

    let params = CameraParameters {
        camera_matrix: camera_matrix_from_mat(&camera_matrix)?,
        dist_coeffs: dist_coeffs.iter::<f64>()?.map(|(_, c)| c).collect(),
        image_size,
        rms_error,
    };
    params.validate()?;

    Ok(params)
}

fn camera_matrix_from_mat(m: &Mat) -> crate::Result<[[f64; 3]; 3]> {
    let rows = m.to_vec_2d::<f64>()?;

    let mut k = [[0.; 3]; 3];
    if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
        return Err(Error::InvalidParameters(format!(
            "camera matrix is {}x{}",
            rows.len(),
            rows.first().map_or(0, Vec::len)
        )));
    }
    for (dst, src) in k.iter_mut().zip(rows) {
        dst.copy_from_slice(&src);
    }

    Ok(k)
}

/// [`CameraParameters`] as OpenCV matrices.
pub struct CameraMats {
    /// f64 | 3x3
    pub camera_matrix: Mat,
    /// f64 | 1xN
    pub dist_coeffs: Mat,
}

impl CameraMats {
    pub fn new(params: &CameraParameters) -> opencv::Result<Self> {
        Ok(Self {
            camera_matrix: Mat::from_slice_2d(&params.camera_matrix)?,
            dist_coeffs: Mat::from_slice_2d(&[params.dist_coeffs.as_slice()])?,
        })
    }

    pub fn undistort(&self, src: &Mat, dst: &mut Mat) -> opencv::Result<()> {
        calib3d::undistort(
            src,
            dst,
            &self.camera_matrix,
            &self.dist_coeffs,
            &core::no_array(),
        )
    }
}

/// Shows `image` until a key is pressed, returns whether that key was `q`.
pub fn display_image(image: &Mat, title: &str, destroy: bool) -> opencv::Result<bool> {
    highgui::imshow(title, image)?;
    let key = highgui::wait_key(0)?;

    if destroy {
        highgui::destroy_window(title)?;
    }

    Ok(key & 0xff == b'q' as i32)
}

/// Shows every image next to its undistorted version, then the first few
/// pairs stacked.
pub fn show_undistorted(images: &[PathBuf], params: &CameraParameters) -> crate::Result<()> {
    const WINDOW: &str = "original | undistorted";

    let mats = CameraMats::new(params)?;
    let mut stack = types::VectorOfMat::new();
    let mut stack_size = None;

    for path in images {
        let Some(img) = read_image(path)? else {
            log::warn!("could not read `{}`", path.display());
            continue;
        };

        let mut undistorted = Mat::default();
        mats.undistort(&img, &mut undistorted)?;

        let mut pair = Mat::default();
        core::hconcat2(&img, &undistorted, &mut pair)?;

        let size = pair.size()?;
        if stack.len() < PREVIEW_PAIRS && *stack_size.get_or_insert(size) == size {
            stack.push(pair.clone());
        }

        log::info!("showing `{}`", path.display());
        if display_image(&pair, WINDOW, false)? {
            break;
        }
    }

    if !stack.is_empty() {
        let mut stacked = Mat::default();
        core::vconcat(&stack, &mut stacked)?;
        display_image(&stacked, WINDOW, false)?;
    }

    highgui::destroy_all_windows()?;
    Ok(())
}

/// A camera or video file opened through `VideoCapture`.
pub struct VideoCaptureSource {
    capture: VideoCapture,
    live: bool,
    position: u64,
    frame_count: Option<u64>,
}

impl VideoCaptureSource {
    pub fn open(source: &VideoSource) -> crate::Result<Self> {
        let (capture, live) = match source {
            VideoSource::Camera(i) => (VideoCapture::new(*i, videoio::CAP_ANY)?, true),
            VideoSource::File(p) => (
                VideoCapture::from_file(path_str(p)?, videoio::CAP_ANY)?,
                false,
            ),
        };

        if !capture.is_opened()? {
            log::error!("could not open {source}");
            return Err(Error::SourceUnavailable(source.to_string()));
        }

        let frame_count = if live {
            None
        } else {
            let n = capture.get(videoio::CAP_PROP_FRAME_COUNT)?;
            (n > 0.).then_some(n as u64)
        };

        log::info!("capturing from {source}");
        if let Some(n) = frame_count {
            log::debug!("source reports {n} frames");
        }

        Ok(Self {
            capture,
            live,
            position: 0,
            frame_count,
        })
    }
}

impl FrameSource for VideoCaptureSource {
    type Frame = Mat;

    fn position(&self) -> u64 {
        self.position
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }

    fn read(&mut self) -> crate::Result<Option<Mat>> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.size()?.width < 1 {
            return Ok(None);
        }

        self.position += 1;
        Ok(Some(frame))
    }

    fn seek(&mut self, frame: u64) -> crate::Result<bool> {
        if self.live {
            return Ok(false);
        }

        let ok = self
            .capture
            .set(videoio::CAP_PROP_POS_FRAMES, frame as f64)?;
        if ok {
            self.position = frame;
        }

        Ok(ok)
    }
}

/// Preview window, optionally undistorting and marking the detected board.
pub struct HighGuiViewer {
    window: String,
    wait_ms: i32,
    undistort: Option<CameraMats>,
    detector: Option<BoardDetector>,
    draw: Mat,
}

impl HighGuiViewer {
    pub fn new(window: &str, wait_ms: i32) -> opencv::Result<Self> {
        highgui::named_window(window, highgui::WINDOW_AUTOSIZE)?;

        Ok(Self {
            window: window.to_owned(),
            wait_ms,
            undistort: None,
            detector: None,
            draw: Mat::default(),
        })
    }

    pub fn with_undistortion(mut self, params: &CameraParameters) -> opencv::Result<Self> {
        self.undistort = Some(CameraMats::new(params)?);
        Ok(self)
    }

    pub fn with_detector(mut self, detector: BoardDetector) -> Self {
        self.detector = Some(detector);
        self
    }
}

impl Viewer<Mat> for HighGuiViewer {
    fn show(&mut self, frame: &Mat) -> crate::Result<i32> {
        match &self.undistort {
            Some(mats) => mats.undistort(frame, &mut self.draw)?,
            None => frame.copy_to(&mut self.draw)?,
        }

        if let Some(detector) = &self.detector {
            if let Some(fb) = detector.find_board(&self.draw, false, true)? {
                draw_charuco_board(&mut self.draw, &fb)?;
            }
        }

        highgui::imshow(&self.window, &self.draw)?;
        Ok(highgui::wait_key(self.wait_ms)?)
    }
}

impl Drop for HighGuiViewer {
    fn drop(&mut self) {
        let _ = highgui::destroy_window(&self.window);
    }
}

/// Encodes frames with `imwrite`, the format follows the file extension.
pub struct ImageWriter;

impl FrameWriter<Mat> for ImageWriter {
    fn write(&mut self, path: &Path, frame: &Mat) -> crate::Result<()> {
        write_image(path, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::{accumulate, SkipReason, MIN_CORNERS};

    const BOARD_PX: i32 = 700;
    const CANVAS: (i32, i32) = (1280, 960);

    fn board_image(board: &CharucoBoard) -> Mat {
        let mut img = Mat::default();
        board
            .generate_image(core::Size::new(BOARD_PX, BOARD_PX), &mut img, 50, 1)
            .unwrap();
        img
    }

    /// Corners of the board image as seen by a 1000 px pinhole camera, with
    /// the board tilted by `ax`/`ay` (rad) and shifted by `tx`/`ty`.
    fn project_quad(ax: f64, ay: f64, tx: f64, ty: f64) -> [(f32, f32); 4] {
        const F: f64 = 1000.;
        const DIST: f64 = 2.;
        let (cx, cy) = (CANVAS.0 as f64 / 2., CANVAS.1 as f64 / 2.);
        let (sin_x, cos_x) = ax.sin_cos();
        let (sin_y, cos_y) = ay.sin_cos();

        [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)].map(|(x, y): (f64, f64)| {
            let (x1, z1) = (cos_y * x, -sin_y * x);
            let (y2, z2) = (cos_x * y - sin_x * z1, sin_x * y + cos_x * z1);
            let (px, py, pz) = (x1 + tx, y2 + ty, z2 + DIST);
            ((F * px / pz + cx) as f32, (F * py / pz + cy) as f32)
        })
    }

    fn warped(board_img: &Mat, quad: [(f32, f32); 4]) -> Mat {
        let n = BOARD_PX as f32;
        let src: core::Vector<core::Point2f> = [(0., 0.), (n, 0.), (n, n), (0., n)]
            .into_iter()
            .map(|(x, y)| core::Point2f::new(x, y))
            .collect();
        let dst: core::Vector<core::Point2f> = quad
            .into_iter()
            .map(|(x, y)| core::Point2f::new(x, y))
            .collect();

        let h = imgproc::get_perspective_transform(&src, &dst, core::DECOMP_LU).unwrap();
        let mut out = Mat::default();
        imgproc::warp_perspective(
            board_img,
            &mut out,
            &h,
            core::Size::new(CANVAS.0, CANVAS.1),
            imgproc::INTER_LINEAR,
            core::BORDER_CONSTANT,
            core::Scalar::all(255.),
        )
        .unwrap();
        out
    }

    fn setup() -> (BoardSpec, CharucoBoard, BoardDetector) {
        let spec = BoardSpec::default();
        let board = generate_board(&spec).unwrap();
        let detector = BoardDetector::new(&board, spec.dictionary).unwrap();
        (spec, board, detector)
    }

    #[test]
    fn detects_rendered_board() {
        let (spec, board, detector) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.png");
        write_image(&path, &board_image(&board)).unwrap();

        let view = detector.detect_view(&path).unwrap().unwrap();
        assert_eq!(view.image_size, (BOARD_PX as u32, BOARD_PX as u32));

        let d = &view.detection;
        assert!(d.len() >= MIN_CORNERS, "only {} corners", d.len());
        assert!(d.len() <= spec.max_corners());
        assert_eq!(d.corners.len(), d.ids.len());
        assert!(d
            .ids
            .iter()
            .all(|&id| (0..spec.max_corners() as i32).contains(&id)));

        let mut acc = CornerAccumulator::new();
        assert_eq!(acc.add(0, Some(view)), Ok(()));
    }

    #[test]
    fn blank_and_missing_images_are_skipped() {
        let (_, _, detector) = setup();
        let dir = tempfile::tempdir().unwrap();

        let blank =
            Mat::new_rows_cols_with_default(480, 640, core::CV_8UC1, core::Scalar::all(255.))
                .unwrap();
        assert!(detector.find_board(&blank, true, true).unwrap().is_none());

        let path = dir.path().join("blank.png");
        write_image(&path, &blank).unwrap();
        let view = detector.detect_view(&path).unwrap().unwrap();
        assert!(view.detection.is_empty());

        let mut acc = CornerAccumulator::new();
        assert_eq!(acc.add(0, Some(view)), Err(SkipReason::TooFewCorners(0)));

        let missing = detector
            .detect_view(&dir.path().join("missing.png"))
            .unwrap();
        assert!(missing.is_none());
        assert_eq!(acc.add(1, missing), Err(SkipReason::Unreadable));
        assert!(acc.is_empty());
    }

    #[test]
    fn calibrates_from_warped_views() {
        let (_, board, detector) = setup();
        let dir = tempfile::tempdir().unwrap();
        let board_img = board_image(&board);

        let poses = [
            (0., 0., 0., 0.),
            (0.3, 0., 0., 0.),
            (-0.3, 0., 0., 0.),
            (0., 0.35, 0., 0.),
            (0., -0.35, 0., 0.),
            (0.25, 0.25, 0.2, -0.1),
            (-0.2, 0.3, -0.2, 0.1),
        ];
        let paths: Vec<PathBuf> = poses
            .iter()
            .enumerate()
            .map(|(i, &(ax, ay, tx, ty))| {
                let p = dir.path().join(format!("view{i}.png"));
                write_image(&p, &warped(&board_img, project_quad(ax, ay, tx, ty))).unwrap();
                p
            })
            .collect();

        let views = accumulate(&paths[..], |p| detector.detect_view(p)).unwrap();
        assert!(views.len() >= 4, "only {} usable views", views.len());
        assert_eq!(views.image_size(), Some((CANVAS.0 as u32, CANVAS.1 as u32)));

        let params = calibrate(&board, &views).unwrap();
        params.validate().unwrap();
        assert_eq!(params.image_size, (CANVAS.0 as u32, CANVAS.1 as u32));
        assert!(params.dist_coeffs.len() >= 8);

        let (fx, fy) = params.focal_length();
        assert!(fx > 0.);
        assert!((fx - fy).abs() <= 1e-6 * fx, "aspect ratio moved: {fx} vs {fy}");

        for name in ["camera_parameters.json", "camera_parameters.calib"] {
            let path = dir.path().join(name);
            params.save(&path).unwrap();
            assert_eq!(CameraParameters::load(&path).unwrap(), params, "{name}");
        }
    }
}
