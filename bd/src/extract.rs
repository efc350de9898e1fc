//! Poppler-based page extraction
//!
//! Rasterizes pages with `pdftoppm` and pulls the embedded text layer
//! with `pdftotext`. Both ship with poppler-utils; the engine only sees
//! the `PageExtractor` trait.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use eyre::{Result, WrapErr, eyre};
use tokio::process::Command;
use tracing::debug;

use crate::providers::{ExtractedPage, PageExtractor};

/// Rasterization DPI; book scans need enough resolution for OCR
const RENDER_DPI: &str = "300";

/// Extracts pages by shelling out to poppler-utils
pub struct PopplerExtractor {
    /// Directory page images land in
    work_dir: PathBuf,
}

impl PopplerExtractor {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl PageExtractor for PopplerExtractor {
    async fn page_count(&self, pdf_path: &Path) -> Result<u32> {
        let output = Command::new("pdfinfo")
            .arg(pdf_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .wrap_err("pdfinfo not found; install poppler-utils")?;

        if !output.status.success() {
            return Err(eyre!(
                "pdfinfo failed for {}: {}",
                pdf_path.display(),
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .find_map(|line| line.strip_prefix("Pages:"))
            .and_then(|rest| rest.trim().parse().ok())
            .ok_or_else(|| eyre!("pdfinfo output had no page count for {}", pdf_path.display()))
    }

    async fn extract_page(&self, pdf_path: &Path, page: u32) -> Result<ExtractedPage> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .wrap_err("failed to create extraction directory")?;

        let prefix = self.work_dir.join(format!("page-{page}"));
        let render = Command::new("pdftoppm")
            .args(["-png", "-r", RENDER_DPI, "-f"])
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg(pdf_path)
            .arg(&prefix)
            .stderr(Stdio::piped())
            .output()
            .await
            .wrap_err("pdftoppm not found; install poppler-utils")?;

        if !render.status.success() {
            return Err(eyre!(
                "pdftoppm failed for page {page}: {}",
                String::from_utf8_lossy(&render.stderr)
            ));
        }

        // pdftoppm pads the page number in its output name; find what it
        // actually produced
        let image_path = find_rendered_image(&self.work_dir, page)
            .await
            .ok_or_else(|| eyre!("pdftoppm produced no image for page {page}"))?;

        let text = Command::new("pdftotext")
            .args(["-f"])
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg(pdf_path)
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .wrap_err("pdftotext not found; install poppler-utils")?;

        let embedded_text = if text.status.success() {
            let content = String::from_utf8_lossy(&text.stdout).trim().to_string();
            (!content.is_empty()).then_some(content)
        } else {
            None
        };

        debug!(page, image = %image_path.display(), has_text = embedded_text.is_some(), "Page extracted");
        Ok(ExtractedPage {
            image_path,
            embedded_text,
        })
    }
}

async fn find_rendered_image(dir: &Path, page: u32) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let want_prefix = format!("page-{page}-");

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&want_prefix) && name.ends_with(".png") {
            return Some(entry.path());
        }
    }
    None
}
