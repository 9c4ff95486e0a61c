use anyhow::{Context, Result};
use camcalib_common::{
    capture::{CaptureLoop, OutputNaming, VideoSource},
    cv::{self, BoardDetector, HighGuiViewer, ImageWriter, VideoCaptureSource},
    BoardSpec, CameraParameters,
};
use std::path::PathBuf;

const WINDOW: &str = "frame";

pub struct CaptureOptions {
    pub source: VideoSource,
    pub dir: PathBuf,
    pub ext: String,
    pub wait_ms: u16,
    pub params: Option<PathBuf>,
    pub detect: bool,
    pub board: Option<PathBuf>,
}

pub fn capture(opts: CaptureOptions) -> Result<()> {
    let source = VideoCaptureSource::open(&opts.source)?;

    let mut viewer = HighGuiViewer::new(WINDOW, opts.wait_ms.max(1) as i32)?;
    if let Some(p) = &opts.params {
        let params = CameraParameters::load(p)
            .with_context(|| format!("loading camera parameters from `{}`", p.display()))?;
        viewer = viewer.with_undistortion(&params)?;
    }
    if opts.detect {
        let spec = BoardSpec::load_or_default(opts.board.as_deref())?;
        let board = cv::generate_board(&spec)?;
        viewer = viewer.with_detector(BoardDetector::new(&board, spec.dictionary)?);
    }

    let naming = OutputNaming::new(&opts.dir, &opts.ext);
    log::info!(
        "storing `.{}` images in `{}`",
        opts.ext.trim_start_matches('.'),
        naming.dir().display()
    );

    let summary = CaptureLoop::new(source, viewer, ImageWriter, naming).run()?;
    log::info!(
        "saved {} of {} frames read",
        summary.saved.len(),
        summary.frames_read
    );

    Ok(())
}
