//! Operator driven capture of calibration frames.
//!
//! The loop is generic over where frames come from ([`FrameSource`]), how
//! they are shown ([`Viewer`]) and how they are stored ([`FrameWriter`]).
//! OpenCV backed implementations live in [`crate::cv`].

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{Error, Result};

/// A failed read this close to the reported frame count is treated as the
/// end of the stream rather than an error. Containers often overstate their
/// length by a few frames.
pub const END_OF_STREAM_TOLERANCE: u64 = 5;

pub const SHORT_STEP: u64 = 1;
pub const LONG_STEP: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    Camera(i32),
    File(PathBuf),
}

impl FromStr for VideoSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse() {
            Ok(index) => Self::Camera(index),
            Err(_) => Self::File(s.into()),
        })
    }
}

impl Display for VideoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Camera(i) => write!(f, "camera #{i}"),
            Self::File(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Where saved frames go and what they are called.
#[derive(Debug, Clone)]
pub struct OutputNaming {
    dir: PathBuf,
    ext: String,
}

impl OutputNaming {
    pub fn new(dir: impl Into<PathBuf>, ext: &str) -> Self {
        Self {
            dir: dir.into(),
            ext: ext.trim_start_matches('.').to_owned(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, sequence: usize, frame: u64) -> String {
        format!(
            "calibration_chessboard_{sequence:03}_frame{frame:06}.{}",
            self.ext
        )
    }

    pub fn path(&self, sequence: usize, frame: u64) -> PathBuf {
        self.dir.join(self.file_name(sequence, frame))
    }
}

/// Creates `dir` (and its parents) unless it already exists.
/// Returns whether anything was created.
pub fn ensure_directory(dir: &Path) -> Result<bool> {
    if dir.is_dir() {
        return Ok(false);
    }

    fs::create_dir_all(dir)?;
    log::info!("created directory `{}`", dir.display());

    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    Save,
    Quit,
    TogglePause,
    Back(u64),
}

impl KeyCommand {
    /// Maps a `wait_key` code. Negative codes mean no key was pressed.
    pub fn from_key(key: i32) -> Option<Self> {
        if key < 0 {
            return None;
        }

        match (key & 0xff) as u8 {
            b'\r' | b'\n' | b's' => Some(Self::Save),
            // esc
            b'q' | 27 => Some(Self::Quit),
            b' ' | b'p' => Some(Self::TogglePause),
            b'b' | b',' => Some(Self::Back(SHORT_STEP)),
            b'B' | b'<' => Some(Self::Back(LONG_STEP)),
            _ => None,
        }
    }
}

pub trait FrameSource {
    type Frame;

    /// Index of the frame the next [`read`](Self::read) returns.
    fn position(&self) -> u64;

    /// Length as reported by the source, `None` for live sources.
    fn frame_count(&self) -> Option<u64>;

    /// `Ok(None)` when no frame could be decoded.
    fn read(&mut self) -> Result<Option<Self::Frame>>;

    /// Returns `false` if the source does not support seeking.
    fn seek(&mut self, frame: u64) -> Result<bool>;
}

pub trait Viewer<F> {
    /// Shows `frame` and returns the pressed key code (negative for none).
    fn show(&mut self, frame: &F) -> Result<i32>;
}

pub trait FrameWriter<F> {
    fn write(&mut self, path: &Path, frame: &F) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct CaptureSummary {
    pub saved: Vec<PathBuf>,
    pub frames_read: u64,
}

pub struct CaptureLoop<S, V, W> {
    source: S,
    viewer: V,
    writer: W,
    naming: OutputNaming,
    paused: bool,
}

impl<S, V, W> CaptureLoop<S, V, W>
where
    S: FrameSource,
    V: Viewer<S::Frame>,
    W: FrameWriter<S::Frame>,
{
    pub fn new(source: S, viewer: V, writer: W, naming: OutputNaming) -> Self {
        Self {
            source,
            viewer,
            writer,
            naming,
            paused: false,
        }
    }

    fn near_end(&self, index: u64) -> bool {
        match self.source.frame_count() {
            Some(count) if count > 0 => index + END_OF_STREAM_TOLERANCE >= count,
            _ => false,
        }
    }

    fn advance(
        &mut self,
        current: &mut Option<(u64, S::Frame)>,
        summary: &mut CaptureSummary,
    ) -> Result<()> {
        let index = self.source.position();

        match self.source.read()? {
            Some(frame) => {
                *current = Some((index, frame));
                summary.frames_read += 1;
            }
            None if current.is_some() && self.near_end(index) => {
                log::debug!("no frame at {index}, showing the last one again");
            }
            None => {
                log::error!("failed to read frame {index}");
                return Err(Error::FrameRead(index));
            }
        }

        Ok(())
    }

    /// Runs until the operator quits or an error halts the loop.
    pub fn run(mut self) -> Result<CaptureSummary> {
        ensure_directory(self.naming.dir())?;
        log::info!(
            "<Enter> saves a frame, <Space> pauses, `b`/`B` step back 1/{LONG_STEP} frames, `q` exits"
        );

        let mut summary = CaptureSummary::default();
        let mut current = None;
        let mut needs_read = true;

        loop {
            if !self.paused || needs_read {
                self.advance(&mut current, &mut summary)?;
                needs_read = false;
            }

            let (index, frame) = current
                .as_ref()
                .ok_or(Error::FrameRead(self.source.position()))?;
            let index = *index;

            let key = self.viewer.show(frame)?;
            match KeyCommand::from_key(key) {
                Some(KeyCommand::Quit) => {
                    log::info!("exiting");
                    break;
                }

                Some(KeyCommand::Save) => {
                    let path = self.naming.path(summary.saved.len(), index);
                    if path.exists() {
                        log::error!("file `{}` already exists", path.display());
                        return Err(Error::OutputExists(path));
                    }

                    self.writer.write(&path, frame)?;
                    log::info!("wrote frame {index} to `{}`", path.display());
                    summary.saved.push(path);
                }

                Some(KeyCommand::TogglePause) => {
                    self.paused = !self.paused;
                    log::info!("{}", if self.paused { "paused" } else { "playing" });
                }

                Some(KeyCommand::Back(step)) => {
                    let target = index.saturating_sub(step);
                    if self.source.seek(target)? {
                        log::debug!("seeking to frame {target}");
                        needs_read = true;
                    } else {
                        log::warn!("source cannot seek, staying at frame {index}");
                    }
                }

                None => (),
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    struct MockSource {
        frames: Vec<u32>,
        position: u64,
        reported_count: Option<u64>,
        broken: HashSet<u64>,
        seekable: bool,
    }

    impl MockSource {
        fn new(len: u32) -> Self {
            Self {
                frames: (0..len).collect(),
                position: 0,
                reported_count: Some(len as u64),
                broken: HashSet::new(),
                seekable: true,
            }
        }
    }

    impl FrameSource for MockSource {
        type Frame = u32;

        fn position(&self) -> u64 {
            self.position
        }

        fn frame_count(&self) -> Option<u64> {
            self.reported_count
        }

        fn read(&mut self) -> Result<Option<u32>> {
            if self.broken.contains(&self.position) {
                return Ok(None);
            }

            let frame = self.frames.get(self.position as usize).copied();
            if frame.is_some() {
                self.position += 1;
            }
            Ok(frame)
        }

        fn seek(&mut self, frame: u64) -> Result<bool> {
            if self.seekable {
                self.position = frame;
            }
            Ok(self.seekable)
        }
    }

    /// Replays keys, then quits.
    #[derive(Default)]
    struct MockViewer {
        keys: VecDeque<i32>,
        shown: Vec<u32>,
    }

    impl MockViewer {
        fn with_keys(keys: &[i32]) -> Self {
            Self {
                keys: keys.iter().copied().collect(),
                shown: vec![],
            }
        }
    }

    impl Viewer<u32> for &mut MockViewer {
        fn show(&mut self, frame: &u32) -> Result<i32> {
            self.shown.push(*frame);
            Ok(self.keys.pop_front().unwrap_or(b'q' as i32))
        }
    }

    struct FileWriter;

    impl FrameWriter<u32> for FileWriter {
        fn write(&mut self, path: &Path, frame: &u32) -> Result<()> {
            fs::write(path, frame.to_string())?;
            Ok(())
        }
    }

    const NONE: i32 = -1;
    const ENTER: i32 = 13;
    const SPACE: i32 = b' ' as i32;
    const BACK: i32 = b'b' as i32;
    const BACK_LONG: i32 = b'B' as i32;
    const QUIT: i32 = b'q' as i32;

    fn run(
        source: MockSource,
        keys: &[i32],
        dir: &Path,
    ) -> (Result<CaptureSummary>, Vec<u32>) {
        let mut viewer = MockViewer::with_keys(keys);
        let res = CaptureLoop::new(source, &mut viewer, FileWriter, OutputNaming::new(dir, "jpg"))
            .run();
        (res, viewer.shown)
    }

    #[test]
    fn saves_with_sequence_and_frame_number() {
        let dir = tempfile::tempdir().unwrap();
        let (res, shown) = run(
            MockSource::new(10),
            &[ENTER, NONE, ENTER, QUIT],
            dir.path(),
        );
        let summary = res.unwrap();

        assert_eq!(shown, [0, 1, 2, 3]);
        assert_eq!(summary.frames_read, 4);

        let names: Vec<_> = summary
            .saved
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            names,
            [
                "calibration_chessboard_000_frame000000.jpg",
                "calibration_chessboard_001_frame000002.jpg"
            ]
        );
        assert_eq!(fs::read_to_string(&summary.saved[1]).unwrap(), "2");
    }

    #[test]
    fn never_overwrites_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let existing = OutputNaming::new(dir.path(), "jpg").path(0, 0);
        fs::write(&existing, "keep").unwrap();

        let (res, _) = run(MockSource::new(10), &[ENTER, ENTER], dir.path());

        assert!(matches!(res, Err(Error::OutputExists(p)) if p == existing));
        assert_eq!(fs::read_to_string(&existing).unwrap(), "keep");
    }

    #[test]
    fn creates_missing_directory_and_tolerates_existing_one() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        assert!(ensure_directory(&nested).unwrap());
        assert!(!ensure_directory(&nested).unwrap());
        assert!(nested.is_dir());

        let (res, _) = run(MockSource::new(3), &[QUIT], &nested);
        assert!(res.unwrap().saved.is_empty());
    }

    #[test]
    fn pause_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let (res, shown) = run(
            MockSource::new(10),
            &[SPACE, NONE, NONE, SPACE, QUIT],
            dir.path(),
        );

        assert_eq!(shown, [0, 0, 0, 0, 1]);
        assert_eq!(res.unwrap().frames_read, 2);
    }

    #[test]
    fn steps_back_and_saturates_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut keys = vec![NONE; 12];
        keys.extend([BACK_LONG, BACK, BACK, BACK, ENTER, QUIT]);

        let (res, shown) = run(MockSource::new(20), &keys, dir.path());

        assert_eq!(shown[11..], [11, 12, 2, 1, 0, 0, 1]);
        let saved = res.unwrap().saved;
        assert_eq!(saved, [OutputNaming::new(dir.path(), "jpg").path(0, 0)]);
    }

    #[test]
    fn stepping_back_while_paused_reads_once() {
        let dir = tempfile::tempdir().unwrap();
        let (res, shown) = run(
            MockSource::new(10),
            &[NONE, NONE, NONE, SPACE, BACK, NONE, QUIT],
            dir.path(),
        );

        assert_eq!(shown, [0, 1, 2, 3, 3, 2, 2]);
        assert!(res.is_ok());
    }

    #[test]
    fn unseekable_source_keeps_playing() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockSource::new(10);
        source.seekable = false;
        source.reported_count = None;

        let (res, shown) = run(source, &[NONE, BACK, QUIT], dir.path());

        assert_eq!(shown, [0, 1, 2]);
        assert!(res.is_ok());
    }

    #[test]
    fn reuses_last_frame_near_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockSource::new(3);
        source.reported_count = Some(5);

        let (res, shown) = run(source, &[NONE, NONE, NONE, ENTER, QUIT], dir.path());

        assert_eq!(shown, [0, 1, 2, 2, 2]);
        let summary = res.unwrap();
        assert_eq!(summary.frames_read, 3);
        assert_eq!(
            summary.saved,
            [OutputNaming::new(dir.path(), "jpg").path(0, 2)]
        );
    }

    #[test]
    fn failed_read_mid_stream_halts() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockSource::new(100);
        source.broken.insert(2);

        let (res, shown) = run(source, &[NONE; 10], dir.path());

        assert_eq!(shown, [0, 1]);
        assert!(matches!(res, Err(Error::FrameRead(2))));
    }

    #[test]
    fn failed_read_on_live_source_halts() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockSource::new(1);
        source.reported_count = None;

        let (res, shown) = run(source, &[NONE; 10], dir.path());

        assert_eq!(shown, [0]);
        assert!(matches!(res, Err(Error::FrameRead(1))));
    }

    #[test]
    fn empty_stream_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (res, shown) = run(MockSource::new(0), &[], dir.path());

        assert!(shown.is_empty());
        assert!(matches!(res, Err(Error::FrameRead(0))));
    }

    #[test]
    fn key_mapping() {
        assert_eq!(KeyCommand::from_key(-1), None);
        assert_eq!(KeyCommand::from_key(13), Some(KeyCommand::Save));
        assert_eq!(KeyCommand::from_key(27), Some(KeyCommand::Quit));
        assert_eq!(KeyCommand::from_key(0x100000 | b'q' as i32), Some(KeyCommand::Quit));
        assert_eq!(KeyCommand::from_key(SPACE), Some(KeyCommand::TogglePause));
        assert_eq!(KeyCommand::from_key(BACK), Some(KeyCommand::Back(1)));
        assert_eq!(KeyCommand::from_key(BACK_LONG), Some(KeyCommand::Back(10)));
        assert_eq!(KeyCommand::from_key(b'x' as i32), None);
    }

    #[test]
    fn parses_video_source() {
        assert_eq!("0".parse::<VideoSource>(), Ok(VideoSource::Camera(0)));
        assert_eq!(
            "clip.mp4".parse::<VideoSource>(),
            Ok(VideoSource::File(PathBuf::from("clip.mp4")))
        );
    }

    #[test]
    fn naming_strips_leading_dot() {
        let n = OutputNaming::new("out", ".png");
        assert_eq!(
            n.path(12, 345),
            Path::new("out").join("calibration_chessboard_012_frame000345.png")
        );
    }
}
