mod capture;
mod generate;
mod process;

use anyhow::Result;
use camcalib_common::{capture::VideoSource, Error};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// More log output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// The action to take
    #[command(subcommand)]
    command: CLICommand,
}

/// Calibration target type
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Method {
    Aruco,
    Plain,
}

#[derive(Subcommand)]
enum CLICommand {
    /// Generates a printable ChArUco board image
    Generate {
        #[arg(short, long, value_enum, default_value_t = Method::Aruco)]
        method: Method,

        /// Board geometry as JSON, defaults to a 7x7 DICT_6X6_250 board
        #[arg(long)]
        board: Option<PathBuf>,

        /// File to save the board image to
        #[arg(short, long, default_value = "chessboard.png")]
        output: PathBuf,

        /// Side of the generated (square) image (px)
        #[arg(long, default_value_t = 2000)]
        size: u16,

        /// Margin around the board (px)
        #[arg(long, default_value_t = 0)]
        margin: u16,
    },

    /// Saves frames from a camera or video file into a directory
    Capture {
        /// Camera index or video file
        source: VideoSource,

        /// Directory to save images to, created if missing
        dir: PathBuf,

        /// Image file extension
        #[arg(default_value = "jpg")]
        ext: String,

        /// Delay between frames (ms)
        #[arg(long, default_value_t = 30)]
        wait_ms: u16,

        /// Existing camera parameters to undistort the preview with
        #[arg(short, long)]
        params: Option<PathBuf>,

        /// Mark the detected board in the preview
        #[arg(short, long, default_value_t = false)]
        detect: bool,

        /// Board geometry as JSON, used with --detect
        #[arg(long)]
        board: Option<PathBuf>,
    },

    /// Computes camera parameters from the images (with extension `ext`) in `dir`
    Process {
        dir: PathBuf,

        ext: String,

        #[arg(short, long, value_enum, default_value_t = Method::Aruco)]
        method: Method,

        /// Show original and undistorted images afterwards
        #[arg(short, long, default_value_t = false)]
        display: bool,

        /// File to save the parameters to (`.json`, anything else is binary)
        #[arg(short, long, default_value = "camera_parameters.json")]
        output: PathBuf,

        /// Board geometry as JSON
        #[arg(long)]
        board: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        CLICommand::Generate {
            method,
            board,
            output,
            size,
            margin,
        } => match method {
            Method::Aruco => generate::generate(board.as_deref(), &output, size, margin)?,
            Method::Plain => {
                return Err(Error::Unimplemented("plain chessboard generation").into())
            }
        },

        CLICommand::Capture {
            source,
            dir,
            ext,
            wait_ms,
            params,
            detect,
            board,
        } => capture::capture(capture::CaptureOptions {
            source,
            dir,
            ext,
            wait_ms,
            params,
            detect,
            board,
        })?,

        CLICommand::Process {
            dir,
            ext,
            method,
            display,
            output,
            board,
        } => match method {
            Method::Aruco => process::process(&dir, &ext, board.as_deref(), &output, display)?,
            Method::Plain => {
                return Err(Error::Unimplemented("plain chessboard calibration").into())
            }
        },
    };

    Ok(())
}
