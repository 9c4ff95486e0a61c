use anyhow::{Context, Result};
use camcalib_common::{cv, BoardSpec};
use opencv::core;
use std::path::Path;

pub fn generate(board: Option<&Path>, output: &Path, size: u16, margin: u16) -> Result<()> {
    let spec = BoardSpec::load_or_default(board).context("loading board geometry")?;
    let board = cv::generate_board(&spec)?;

    log::debug!("{spec:?}");
    cv::export_board(
        &board,
        output,
        core::Size::new(size as i32, size as i32),
        margin as i32,
    )
    .with_context(|| format!("exporting board to `{}`", output.display()))?;

    log::info!("board successfully exported to `{}`", output.display());
    Ok(())
}
