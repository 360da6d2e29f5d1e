//! FFmpeg command wrappers for comparison videos.
//!
//! Two render shapes: subtitles burned into the source video, and a
//! side-by-side panel with the video on the left and both step lists on
//! the right. Neither ever shows a producer name.

use std::path::Path;

use blindeval_core::blinding::BlindLabel;

/// Characters per line in the step panel before wrapping.
pub const PANEL_WRAP_WIDTH: usize = 48;

const PANEL_FONT_SIZE: u32 = 14;
const PANEL_LINE_SPACING: u32 = 3;

/// Error type for FFmpeg operations.
#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("ffmpeg binary not found: {0}")]
    NotFound(std::io::Error),

    #[error("ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("video file not found: {0}")]
    VideoNotFound(String),
}

/// One blinded step list drawn in the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelText {
    pub label: BlindLabel,
    pub steps: Vec<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Check that `ffmpeg` is installed. Returns its version banner line.
pub async fn check_ffmpeg() -> Result<String, FfmpegError> {
    let output = tokio::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await
        .map_err(FfmpegError::NotFound)?;
    if !output.status.success() {
        return Err(FfmpegError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().to_string())
}

/// Burn an ASS subtitle file into a video, copying the audio stream.
pub async fn burn_subtitles(
    video_path: &Path,
    subtitle_path: &Path,
    output_path: &Path,
) -> Result<(), FfmpegError> {
    ensure_exists(video_path)?;
    let filter = format!("ass={}", escape_filter_value(&subtitle_path.to_string_lossy()));

    let output = tokio::process::Command::new("ffmpeg")
        .arg("-i")
        .arg(video_path)
        .args(["-vf", &filter, "-c:a", "copy", "-y"])
        .arg(output_path)
        .output()
        .await
        .map_err(FfmpegError::NotFound)?;
    check_output(&output)
}

/// Render the side-by-side step panel.
///
/// The video is scaled to half width on the left; the right half is black
/// with the first list at the top and the second from mid-height, each in
/// its label colour. The step texts are written next to `output_path` and
/// removed afterwards.
pub async fn render_step_panel(
    video_path: &Path,
    panels: &[PanelText; 2],
    output_path: &Path,
) -> Result<(), FfmpegError> {
    ensure_exists(video_path)?;
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "panel".to_string());
    let dir = output_path.parent().unwrap_or_else(|| Path::new("."));

    let mut text_files = Vec::with_capacity(panels.len());
    for panel in panels {
        let path = dir.join(format!("{stem}_{}.txt", panel.label));
        tokio::fs::write(&path, format_panel_text(&panel.steps, PANEL_WRAP_WIDTH)).await?;
        text_files.push(path);
    }

    let filter = panel_filter(panels, &text_files);
    let result = tokio::process::Command::new("ffmpeg")
        .arg("-i")
        .arg(video_path)
        .args(["-vf", &filter, "-c:a", "copy", "-y"])
        .arg(output_path)
        .output()
        .await;

    for path in &text_files {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove panel text file");
        }
    }

    let output = result.map_err(FfmpegError::NotFound)?;
    check_output(&output)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_exists(path: &Path) -> Result<(), FfmpegError> {
    if !path.exists() {
        return Err(FfmpegError::VideoNotFound(path.to_string_lossy().to_string()));
    }
    Ok(())
}

fn check_output(output: &std::process::Output) -> Result<(), FfmpegError> {
    if !output.status.success() {
        return Err(FfmpegError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(())
}

/// Escape a value for use inside an ffmpeg filter graph option.
fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':' | '\'' | ',' | ';' | '[' | ']' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn panel_filter(panels: &[PanelText; 2], text_files: &[std::path::PathBuf]) -> String {
    let draw = |panel: &PanelText, file: &Path, y: &str| {
        format!(
            "drawtext=textfile={}:fontcolor={}:fontsize={PANEL_FONT_SIZE}:x=10:y={y}:line_spacing={PANEL_LINE_SPACING}",
            escape_filter_value(&file.to_string_lossy()),
            panel.label,
        )
    };
    let top = draw(&panels[0], &text_files[0], "10");
    let bottom = draw(&panels[1], &text_files[1], "h/2");
    format!(
        "[0:v]split[original][fortext];\
         [original]scale=iw/2:ih[left];\
         [fortext]scale=iw/2:ih,drawbox=color=black:t=fill,{top},{bottom}[right];\
         [left][right]hstack"
    )
}

/// Number the steps and wrap each to `width` characters, continuation
/// lines indented under the text.
pub fn format_panel_text(steps: &[String], width: usize) -> String {
    let mut out = String::new();
    for (i, step) in steps.iter().enumerate() {
        let prefix = format!("{}. ", i + 1);
        let indent = " ".repeat(prefix.len());
        let available = width.saturating_sub(prefix.len()).max(1);
        for (n, line) in wrap_words(step, available).into_iter().enumerate() {
            out.push_str(if n == 0 { &prefix } else { &indent });
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

fn wrap_words(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn filter_values_escaped() {
        assert_eq!(escape_filter_value("/tmp/a:b/c'd.ass"), "/tmp/a\\:b/c\\'d.ass");
    }

    #[test]
    fn panel_text_numbers_and_wraps() {
        let steps = vec![
            "Pick up the screw from the bin".to_string(),
            "Insert it".to_string(),
        ];
        let text = format_panel_text(&steps, 16);
        assert_eq!(text, "1. Pick up the\n   screw from\n   the bin\n2. Insert it\n");
    }

    #[test]
    fn panel_filter_uses_label_colours_only() {
        let panels = [
            PanelText {
                label: BlindLabel::Yellow,
                steps: vec!["a".to_string()],
            },
            PanelText {
                label: BlindLabel::Red,
                steps: vec!["b".to_string()],
            },
        ];
        let files = vec![
            std::path::PathBuf::from("/s/x_yellow.txt"),
            std::path::PathBuf::from("/s/x_red.txt"),
        ];
        let filter = panel_filter(&panels, &files);
        assert!(filter.contains("textfile=/s/x_yellow.txt:fontcolor=yellow"));
        assert!(filter.contains("textfile=/s/x_red.txt:fontcolor=red"));
        assert!(filter.ends_with("[left][right]hstack"));
    }

    #[tokio::test]
    async fn missing_video_reported_before_running_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let err = burn_subtitles(
            &dir.path().join("missing.mp4"),
            &dir.path().join("a.ass"),
            &dir.path().join("out.mp4"),
        )
        .await;
        assert_matches!(err, Err(FfmpegError::VideoNotFound(_)));
    }
}
