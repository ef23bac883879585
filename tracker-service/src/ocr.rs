//! Screenshot and OCR helpers backed by external commands.
//!
//! `CommandCapturer` shells out to a screenshot tool (macOS `screencapture`
//! by default) and crops the Find My list into one image per row.
//! `CommandRecognizer` runs an OCR tool (`tesseract` by default) on a row
//! image and returns its text lines.

use crate::config::{CaptureConfig, RegionLayout};
use crate::cycle::{CaptureError, CapturedScreen, ScreenCapturer, TextRecognizer};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Trim each line, collapse inner whitespace and drop blank lines. Output
/// where no line has at least two characters is treated as no text.
pub fn clean_ocr_output(stdout: &str) -> Vec<String> {
    let lines: Vec<String> = stdout
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();

    if lines.iter().all(|line| line.chars().count() < 2) {
        return Vec::new();
    }
    lines
}

/// Crop the screenshot into row images according to `layout`. Rows that
/// would extend past the bottom of the image are not produced.
pub fn split_regions(
    screenshot: &Path,
    layout: &RegionLayout,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, CaptureError> {
    let img = image::open(screenshot)?;
    let (width, height) = (img.width(), img.height());

    if width < layout.min_image_size || height < layout.min_image_size {
        return Err(CaptureError::InvalidScreenshot(format!(
            "{} is only {}x{}",
            screenshot.display(),
            width,
            height
        )));
    }

    std::fs::create_dir_all(out_dir)?;

    let mut regions = Vec::new();
    for i in 0..layout.count {
        let y = layout.start_y + i * (layout.height + layout.spacing);
        if y + layout.height > height {
            debug!("Row {} extends beyond the screenshot, stopping", i + 1);
            break;
        }

        let row = img.crop_imm(layout.start_x, y, layout.width, layout.height);
        let path = out_dir.join(format!("airtag_{:02}.png", i + 1));
        row.save(&path)?;
        regions.push(path);
    }

    Ok(regions)
}

pub struct CommandCapturer {
    program: String,
    args: Vec<String>,
    screenshots_dir: PathBuf,
    layout: RegionLayout,
    delete_after_processing: bool,
}

impl CommandCapturer {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        screenshots_dir: PathBuf,
        layout: RegionLayout,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            screenshots_dir,
            layout,
            delete_after_processing: false,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        let mut capturer = Self::new(
            config.capture_program.clone(),
            config.capture_args.clone(),
            config.screenshots_dir.clone(),
            config.regions,
        );
        capturer.delete_after_processing = config.delete_after_processing;
        capturer
    }

    fn regions_dir(&self, screenshot_name: &str) -> PathBuf {
        let stem = screenshot_name.trim_end_matches(".png");
        self.screenshots_dir.join("regions").join(stem)
    }
}

#[async_trait]
impl ScreenCapturer for CommandCapturer {
    async fn capture(&self) -> Result<CapturedScreen, CaptureError> {
        tokio::fs::create_dir_all(&self.screenshots_dir).await?;

        let captured_at = Utc::now();
        let filename = captured_at.format("findmy_%Y%m%d_%H%M%S.png").to_string();
        let path = self.screenshots_dir.join(&filename);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Screenshot command failed: {}", stderr);
            return Err(CaptureError::CommandFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(CaptureError::InvalidScreenshot(format!(
                "{} is missing or empty",
                path.display()
            )));
        }
        info!("Screenshot saved: {}", filename);

        let layout = self.layout;
        let regions_dir = self.regions_dir(&filename);
        let blocks = tokio::task::spawn_blocking(move || split_regions(&path, &layout, &regions_dir))
            .await
            .map_err(|e| CaptureError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        Ok(CapturedScreen {
            source: filename,
            captured_at,
            blocks,
        })
    }

    async fn release(&self, screen: &CapturedScreen) {
        if !self.delete_after_processing {
            return;
        }

        let screenshot = self.screenshots_dir.join(&screen.source);
        if let Err(e) = tokio::fs::remove_file(&screenshot).await {
            warn!("Could not delete {}: {}", screenshot.display(), e);
        }
        let regions = self.regions_dir(&screen.source);
        if let Err(e) = tokio::fs::remove_dir_all(&regions).await {
            warn!("Could not delete {}: {}", regions.display(), e);
        }
    }
}

/// Runs `<program> <image> stdout <args...>` and reads the text from stdout
pub struct CommandRecognizer {
    program: String,
    args: Vec<String>,
}

impl CommandRecognizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.ocr_program.clone(), config.ocr_args.clone())
    }
}

#[async_trait]
impl TextRecognizer for CommandRecognizer {
    async fn recognize(&self, block: &Path) -> Result<Vec<String>, CaptureError> {
        let output = Command::new(&self.program)
            .arg(block)
            .arg("stdout")
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::CommandFailed(format!(
                "{} on {}: {}",
                self.program,
                block.display(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines = clean_ocr_output(&stdout);
        if lines.is_empty() {
            warn!("Poor OCR result for {}", block.display());
        } else {
            debug!("OCR {}: {:?}", block.display(), lines);
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn blank_screenshot(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("findmy_test.png");
        image::RgbImage::new(width, height).save(&path).unwrap();
        path
    }

    #[test]
    fn test_clean_ocr_output() {
        assert_eq!(
            clean_ocr_output("  Black   Valize 2km \n\n 5 min ago  Kouter \n"),
            vec!["Black Valize 2km", "5 min ago Kouter"]
        );
        assert!(clean_ocr_output("a\n.\n\n").is_empty());
        assert!(clean_ocr_output("").is_empty());
    }

    #[test]
    fn test_split_regions_full_layout() {
        let dir = tempfile::tempdir().unwrap();
        let shot = blank_screenshot(dir.path(), 700, 1600);

        let rows = split_regions(&shot, &RegionLayout::default(), &dir.path().join("rows")).unwrap();
        assert_eq!(rows.len(), 9);
        assert!(rows[0].ends_with("airtag_01.png"));

        let row = image::open(&rows[8]).unwrap();
        assert_eq!((row.width(), row.height()), (460, 120));
    }

    #[test]
    fn test_split_regions_stops_at_bottom() {
        let dir = tempfile::tempdir().unwrap();
        let shot = blank_screenshot(dir.path(), 700, 800);

        let rows = split_regions(&shot, &RegionLayout::default(), &dir.path().join("rows")).unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_split_regions_rejects_small_image() {
        let dir = tempfile::tempdir().unwrap();
        let shot = blank_screenshot(dir.path(), 300, 300);

        let result = split_regions(&shot, &RegionLayout::default(), &dir.path().join("rows"));
        assert!(matches!(result, Err(CaptureError::InvalidScreenshot(_))));
    }

    #[tokio::test]
    async fn test_capture_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = CommandCapturer::new(
            "false",
            Vec::new(),
            dir.path().to_path_buf(),
            RegionLayout::default(),
        );
        assert!(matches!(
            capturer.capture().await,
            Err(CaptureError::CommandFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_capture_empty_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = CommandCapturer::new(
            "touch",
            Vec::new(),
            dir.path().to_path_buf(),
            RegionLayout::default(),
        );
        assert!(matches!(
            capturer.capture().await,
            Err(CaptureError::InvalidScreenshot(_))
        ));
    }

    #[tokio::test]
    async fn test_recognizer_reads_stdout() {
        let recognizer = CommandRecognizer::new("echo", vec!["Auto".to_string(), "2km".to_string()]);
        let lines = recognizer.recognize(Path::new("row.png")).await.unwrap();
        assert_eq!(lines, vec!["row.png stdout Auto 2km"]);
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // Third field is the state; a zombie is already dead
            Ok(stat) => stat
                .rsplit(") ")
                .next()
                .map(|rest| !rest.starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_recognizer_killed_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("ocr.pid");
        // Run as `sh <block> stdout`, so the block path is the script
        let block = dir.path().join("slow_row.sh");
        std::fs::write(
            &block,
            format!("echo $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();

        let recognizer = CommandRecognizer::new("sh", Vec::new());
        let result =
            tokio::time::timeout(Duration::from_millis(500), recognizer.recognize(&block)).await;
        assert!(result.is_err());

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..50 {
            alive = is_running(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "OCR process {} outlived its timeout", pid);
    }

    #[tokio::test]
    async fn test_recognizer_missing_binary() {
        let recognizer = CommandRecognizer::new("definitely-not-an-ocr-tool", Vec::new());
        assert!(matches!(
            recognizer.recognize(Path::new("row.png")).await,
            Err(CaptureError::Io(_))
        ));
    }
}
