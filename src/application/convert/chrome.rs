use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::histogram;
use tokio::{fs, process::Command};
use tracing::{info, warn};

use crate::infra::telemetry::METRIC_CONVERT_MS;

use super::{
    pool::SessionPool,
    types::{ConvertError, DocumentConverter},
};

const PDF_MAGIC: &[u8] = b"%PDF-";
const STDERR_LIMIT: usize = 2048;

/// Converts HTML to PDF by driving a headless Chromium-compatible browser.
#[derive(Debug, Clone)]
pub struct HeadlessChromeConverter {
    browser_path: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
    sessions: SessionPool,
}

impl HeadlessChromeConverter {
    pub fn new(
        browser_path: PathBuf,
        extra_args: Vec<String>,
        timeout: Duration,
        sessions: SessionPool,
    ) -> Self {
        Self {
            browser_path,
            extra_args,
            timeout,
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    fn command(&self, scratch: &Path, input: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.browser_path);
        command
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--no-pdf-header-footer")
            .arg(format!("--user-data-dir={}", scratch.join("profile").display()))
            .arg(format!("--print-to-pdf={}", output.display()))
            .args(&self.extra_args)
            .arg(format!("file://{}", input.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, html: &str) -> Result<Bytes, ConvertError> {
        let lease = self.sessions.acquire().await?;
        let input = lease.scratch_dir().join("document.html");
        let output = lease.scratch_dir().join("document.pdf");

        fs::write(&input, html).await.map_err(|err| {
            ConvertError::engine_unavailable(format!("failed to stage document: {err}"))
        })?;

        let child = self
            .command(lease.scratch_dir(), &input, &output)
            .spawn()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => ConvertError::engine_unavailable(format!(
                    "browser `{}` not found",
                    self.browser_path.display()
                )),
                _ => ConvertError::engine_unavailable(format!("failed to spawn browser: {err}")),
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let exited = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ConvertError::RenderTimeout {
                timeout: self.timeout,
            })?
            .map_err(|err| ConvertError::engine_unavailable(format!("browser crashed: {err}")))?;

        if !exited.status.success() {
            let stderr = String::from_utf8_lossy(&exited.stderr);
            let stderr: String = stderr.chars().take(STDERR_LIMIT).collect();
            return Err(ConvertError::engine_unavailable(match exited.status.code() {
                Some(code) => format!("browser exited with status {code}: {}", stderr.trim()),
                None => format!("browser terminated by signal: {}", stderr.trim()),
            }));
        }

        let pdf = match fs::read(&output).await {
            Ok(pdf) => pdf,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ConvertError::engine_unavailable(
                    "browser exited without writing a PDF",
                ));
            }
            Err(err) => {
                return Err(ConvertError::engine_unavailable(format!(
                    "failed to read PDF output: {err}"
                )));
            }
        };

        if !pdf.starts_with(PDF_MAGIC) {
            return Err(ConvertError::invalid_document(
                "browser output is not a PDF document",
            ));
        }

        Ok(Bytes::from(pdf))
    }
}

#[async_trait]
impl DocumentConverter for HeadlessChromeConverter {
    async fn convert(&self, html: &str) -> Result<Bytes, ConvertError> {
        let started_at = Instant::now();
        validate_html(html)?;

        let result = self.run(html).await;
        let elapsed_ms = started_at.elapsed().as_millis() as u64;

        match &result {
            Ok(pdf) => {
                histogram!(METRIC_CONVERT_MS, "result" => "ok")
                    .record(started_at.elapsed().as_secs_f64() * 1000.0);
                info!(
                    target = "application::convert::chrome",
                    op = "chrome::convert",
                    result = "ok",
                    elapsed_ms,
                    html_bytes = html.len(),
                    pdf_bytes = pdf.len(),
                    "document converted to PDF"
                );
            }
            Err(err) => {
                histogram!(METRIC_CONVERT_MS, "result" => "error")
                    .record(started_at.elapsed().as_secs_f64() * 1000.0);
                warn!(
                    target = "application::convert::chrome",
                    op = "chrome::convert",
                    result = "error",
                    elapsed_ms,
                    transient = err.is_transient(),
                    error = %err,
                    "document conversion failed"
                );
            }
        }

        result
    }
}

fn validate_html(html: &str) -> Result<(), ConvertError> {
    let trimmed = html.trim_start();
    if trimmed.is_empty() {
        return Err(ConvertError::invalid_document("document is empty"));
    }

    let head: String = trimmed.chars().take(512).collect::<String>().to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.contains("<html") {
        Ok(())
    } else {
        Err(ConvertError::invalid_document("document is not HTML"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs as std_fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    const HTML: &str = "<!DOCTYPE html><html><body><p>P-100</p></body></html>";

    fn make_executable(path: &Path) {
        let mut perms = std_fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std_fs::set_permissions(path, perms).expect("set perms");
    }

    fn fake_browser(dir: &TempDir, body: &str) -> PathBuf {
        let script_path = dir.path().join("fake-chrome");
        let script = format!(
            r#"#!/bin/sh
set -eu
out=""
input=""
for arg in "$@"; do
  case "$arg" in
    --print-to-pdf=*) out="${{arg#--print-to-pdf=}}" ;;
    file://*) input="${{arg#file://}}" ;;
  esac
done
{body}
"#
        );
        std_fs::write(&script_path, script).expect("write script");
        make_executable(&script_path);
        script_path
    }

    fn converter(dir: &TempDir, browser: PathBuf, timeout: Duration) -> HeadlessChromeConverter {
        let sessions = SessionPool::new(2, dir.path().join("sessions")).expect("pool");
        HeadlessChromeConverter::new(browser, Vec::new(), timeout, sessions)
    }

    #[tokio::test]
    async fn converts_with_working_browser() {
        let dir = TempDir::new().expect("temp dir");
        let browser = fake_browser(
            &dir,
            r#"test -s "$input" || exit 3
printf '%%PDF-1.7\nfake\n%%%%EOF\n' > "$out""#,
        );
        let converter = converter(&dir, browser, Duration::from_secs(5));

        let pdf = converter.convert(HTML).await.expect("pdf");

        assert!(pdf.starts_with(PDF_MAGIC));
        assert_eq!(converter.sessions().available(), 2);
    }

    #[tokio::test]
    async fn passes_headless_print_arguments() {
        let dir = TempDir::new().expect("temp dir");
        let args_path = dir.path().join("args.log");
        let browser = fake_browser(
            &dir,
            &format!(
                r#"echo "$@" > "{}"
printf '%%%%PDF-1.4\n' > "$out""#,
                args_path.display()
            ),
        );
        let converter = converter(&dir, browser, Duration::from_secs(5));

        converter.convert(HTML).await.expect("pdf");

        let args = std_fs::read_to_string(&args_path).expect("args");
        assert!(args.contains("--headless"));
        assert!(args.contains("--print-to-pdf="));
        assert!(args.contains("file://"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_engine_unavailable() {
        let dir = TempDir::new().expect("temp dir");
        let browser = fake_browser(&dir, r#"echo "gpu process crashed" >&2; exit 21"#);
        let converter = converter(&dir, browser, Duration::from_secs(5));

        let err = converter.convert(HTML).await.expect_err("must fail");

        match err {
            ConvertError::RenderEngineUnavailable { reason } => {
                assert!(reason.contains("21"));
                assert!(reason.contains("gpu process crashed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(converter.sessions().available(), 2);
    }

    #[tokio::test]
    async fn missing_browser_is_engine_unavailable() {
        let dir = TempDir::new().expect("temp dir");
        let converter = converter(
            &dir,
            dir.path().join("no-such-browser"),
            Duration::from_secs(5),
        );

        let err = converter.convert(HTML).await.expect_err("must fail");

        assert!(matches!(err, ConvertError::RenderEngineUnavailable { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_browser_times_out_and_releases_session() {
        let dir = TempDir::new().expect("temp dir");
        let browser = fake_browser(&dir, "sleep 5");
        let converter = converter(&dir, browser, Duration::from_millis(200));

        let started = Instant::now();
        let err = converter.convert(HTML).await.expect_err("must time out");

        assert!(matches!(err, ConvertError::RenderTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(converter.sessions().available(), 2);
    }

    #[tokio::test]
    async fn non_pdf_output_is_invalid_document() {
        let dir = TempDir::new().expect("temp dir");
        let browser = fake_browser(&dir, r#"echo "<html>not a pdf</html>" > "$out""#);
        let converter = converter(&dir, browser, Duration::from_secs(5));

        let err = converter.convert(HTML).await.expect_err("must fail");

        assert!(matches!(err, ConvertError::InvalidDocument { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn missing_output_is_engine_unavailable() {
        let dir = TempDir::new().expect("temp dir");
        let browser = fake_browser(&dir, "exit 0");
        let converter = converter(&dir, browser, Duration::from_secs(5));

        let err = converter.convert(HTML).await.expect_err("must fail");

        assert!(matches!(err, ConvertError::RenderEngineUnavailable { .. }));
    }

    #[tokio::test]
    async fn rejects_empty_and_non_html_documents() {
        let dir = TempDir::new().expect("temp dir");
        let converter = converter(&dir, dir.path().join("unused"), Duration::from_secs(5));

        for document in ["", "   \n", "%PDF-1.7 already a pdf"] {
            let err = converter.convert(document).await.expect_err("must fail");
            assert!(matches!(err, ConvertError::InvalidDocument { .. }));
        }
    }
}
