//! Recording supervisor.
//!
//! Each publisher gets one external recorder subprocess pulling its stream
//! and writing `<video_name>_<start>.ts` under `<save_path>/<room>/<project>`.
//! On stream close the recorder is killed and the file renamed to carry the
//! stop time. Recorder failures never affect streaming.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Delay before spawning, so the first keyframe is in flight when the
/// recorder connects.
const SETTLE_DELAY: Duration = Duration::from_secs(3);
/// Retry interval while the chosen output filename already exists.
const NAME_RETRY: Duration = Duration::from_secs(1);

pub const TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Everything needed to record one publisher.
#[derive(Debug, Clone)]
pub struct RecordTarget {
    /// RTMP URL the recorder pulls from.
    pub source_url: String,
    pub save_path: String,
    pub room_id: String,
    pub project_id: i64,
    pub video_name: String,
    pub ffmpeg_path: String,
}

/// Handle kept by the owning stream; dropping it does not stop the
/// recorder, [`RecorderHandle::stop`] does.
pub struct RecorderHandle {
    cancel: CancellationToken,
}

impl RecorderHandle {
    /// Kill the subprocess and rename the output file with the stop time.
    /// Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Spawn the supervisor task for one recording.
pub fn start(target: RecordTarget) -> RecorderHandle {
    let cancel = CancellationToken::new();
    tokio::spawn(supervise(target, cancel.clone()));
    RecorderHandle { cancel }
}

async fn supervise(target: RecordTarget, cancel: CancellationToken) {
    tokio::select! {
        () = tokio::time::sleep(SETTLE_DELAY) => {}
        () = cancel.cancelled() => return,
    }

    kill_stale_recorder(&target.source_url).await;

    let out_dir = Path::new(&target.save_path)
        .join(&target.room_id)
        .join(target.project_id.to_string());
    if let Err(err) = tokio::fs::create_dir_all(&out_dir).await {
        error!(dir = %out_dir.display(), %err, "recorder output dir creation failed");
        return;
    }

    let Some(out_file) = pick_output_file(&out_dir, &target.video_name, &cancel).await else {
        return;
    };

    info!(
        url = %target.source_url,
        file = %out_file.display(),
        "starting recorder"
    );
    let mut child = match Command::new(&target.ffmpeg_path)
        .arg("-v")
        .arg("verbose")
        .arg("-i")
        .arg(&target.source_url)
        .arg("-codec")
        .arg("copy")
        .arg(&out_file)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            error!(%err, ffmpeg = %target.ffmpeg_path, "recorder spawn failed");
            return;
        }
    };

    tokio::select! {
        status = child.wait() => {
            // A recorder that dies mid-stream is not restarted; the partial
            // file is renamed when the stream closes.
            warn!(url = %target.source_url, status = ?status, "recorder exited early");
            cancel.cancelled().await;
        }
        () = cancel.cancelled() => {
            if let Err(err) = child.start_kill() {
                warn!(%err, "recorder kill failed");
            }
            let _ = child.wait().await;
        }
    }

    rename_with_stop_time(&out_file);
}

/// Best-effort kill of any stale recorder still pulling the same source URL
/// from a previous run.
async fn kill_stale_recorder(source_url: &str) {
    let result = Command::new("pkill")
        .arg("-9")
        .arg("-f")
        .arg("--")
        .arg(source_url)
        .status()
        .await;
    if let Err(err) = result {
        warn!(%err, "stale recorder cleanup failed");
    }
}

/// `<video_name>_<now>.ts`, retrying while a file with the chosen stamp
/// already exists.
async fn pick_output_file(
    out_dir: &Path,
    video_name: &str,
    cancel: &CancellationToken,
) -> Option<PathBuf> {
    loop {
        let stamp = Local::now().format(TIME_FORMAT);
        let candidate = out_dir.join(format!("{video_name}_{stamp}.ts"));
        if !candidate.exists() {
            return Some(candidate);
        }
        tokio::select! {
            () = tokio::time::sleep(NAME_RETRY) => {}
            () = cancel.cancelled() => return None,
        }
    }
}

/// `<stem>.ts` becomes `<stem>_<now>.ts`. A failed rename leaves the file
/// under its start-time-only name.
fn rename_with_stop_time(out_file: &Path) {
    let Some(renamed) = stop_time_name(out_file, &Local::now().format(TIME_FORMAT).to_string())
    else {
        return;
    };
    match std::fs::rename(out_file, &renamed) {
        Ok(()) => info!(file = %renamed.display(), "recording finalized"),
        Err(err) => error!(file = %out_file.display(), %err, "recording rename failed"),
    }
}

fn stop_time_name(out_file: &Path, stamp: &str) -> Option<PathBuf> {
    let stem = out_file.file_stem()?.to_str()?;
    let ext = out_file.extension()?.to_str()?;
    Some(out_file.with_file_name(format!("{stem}_{stamp}.{ext}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_time_name_appends_stamp() {
        let renamed = stop_time_name(
            Path::new("/rec/R1/12/Camera_20240101T010203.ts"),
            "20240101T020304",
        )
        .unwrap();
        assert_eq!(
            renamed,
            PathBuf::from("/rec/R1/12/Camera_20240101T010203_20240101T020304.ts")
        );
    }

    #[tokio::test]
    async fn pick_output_file_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let first = pick_output_file(dir.path(), "Camera", &cancel).await.unwrap();
        std::fs::write(&first, b"").unwrap();

        // Same second would collide; the picker waits for a fresh stamp.
        let second =
            tokio::time::timeout(Duration::from_secs(3), pick_output_file(dir.path(), "Camera", &cancel))
                .await
                .expect("picker should settle on a new name")
                .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn pick_output_file_returns_promptly_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let blocked = pick_output_file(dir.path(), "Camera", &cancel).await.unwrap();
        std::fs::write(&blocked, b"").unwrap();

        // With the current stamp taken, a cancelled picker must not spin in
        // its retry loop. (It may still succeed if the clock ticked over.)
        cancel.cancel();
        let result = tokio::time::timeout(
            Duration::from_millis(1500),
            pick_output_file(dir.path(), "Camera", &cancel),
        )
        .await
        .expect("cancelled picker must return");
        if let Some(picked) = result {
            assert_ne!(picked, blocked);
        }
    }

    #[test]
    fn rename_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Camera_20240101T010203.ts");
        std::fs::write(&file, b"data").unwrap();

        rename_with_stop_time(&file);
        assert!(!file.exists());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        let name = name.to_str().unwrap();
        assert!(name.starts_with("Camera_20240101T010203_"));
        assert!(name.ends_with(".ts"));
    }
}
