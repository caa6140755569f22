//! Prometheus metrics for one-shot runs
//!
//! The libraries emit through the `metrics` facade:
//!
//! - `credential_resolutions_total` (counter): label `outcome`
//! - `token_refresh_total` (counter): label `result`
//! - `upload_chunks_total` (counter): label `result`
//! - `upload_bytes_total` (counter)
//!
//! There is no scrape endpoint for a process that lives a few seconds, so the
//! rendered exposition text is written to a node-exporter textfile instead.

use std::path::Path;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record how long the whole run took and whether it succeeded.
pub fn record_run(command: &'static str, success: bool, duration_secs: f64) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!("publisher_runs_total", "command" => command, "result" => result)
        .increment(1);
    metrics::gauge!("publisher_last_run_duration_seconds", "command" => command)
        .set(duration_secs);
}

/// Write the rendered metrics to `path` atomically.
///
/// The textfile collector may read at any moment, so the file is written
/// beside the target and renamed over it.
pub fn write_textfile(handle: &PrometheusHandle, path: &Path) -> anyhow::Result<()> {
    let rendered = handle.render();
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("metrics textfile path has no file name")?;
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, rendered)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming metrics textfile to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_run("auth", true, 0.5);
    }

    /// Isolated recorder/handle pair; install_recorder() would claim the
    /// process-wide singleton and panic on a second test.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn run_metrics_render() {
        let (recorder, handle) = isolated_recorder();
        metrics::with_local_recorder(&recorder, || {
            record_run("upload", false, 2.5);
            metrics::counter!("credential_resolutions_total", "outcome" => "refreshed")
                .increment(1);
        });

        let rendered = handle.render();
        assert!(
            rendered.contains(r#"publisher_runs_total{command="upload",result="failure"} 1"#),
            "got: {rendered}"
        );
        assert!(
            rendered.contains(r#"credential_resolutions_total{outcome="refreshed"} 1"#),
            "got: {rendered}"
        );
        assert!(rendered.contains("publisher_last_run_duration_seconds"));
    }

    #[test]
    fn textfile_is_written_atomically() {
        let (recorder, handle) = isolated_recorder();
        metrics::with_local_recorder(&recorder, || record_run("auth", true, 0.1));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shorts.prom");
        write_textfile(&handle, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("publisher_runs_total"), "got: {contents}");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1, "temp file must be renamed away");
    }
}
