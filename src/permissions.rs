use crate::error::{TrackerError, TrackerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenRecordingStatus {
    Granted,
    Denied,
    NotSupported,
}

const SETTINGS_PANE: &str =
    "x-apple.systempreferences:com.apple.preference.security?Privacy_ScreenRecording";

const HELP: &str = "grant Screen Recording permission in System Settings -> Privacy & Security -> Screen Recording, enable your terminal, then re-run";

pub fn screen_recording_status() -> ScreenRecordingStatus {
    #[cfg(target_os = "macos")]
    {
        // SAFETY: takes no arguments and only reads the TCC state of this process.
        if unsafe { CGPreflightScreenCaptureAccess() } {
            ScreenRecordingStatus::Granted
        } else {
            ScreenRecordingStatus::Denied
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        ScreenRecordingStatus::NotSupported
    }
}

/// Gate for native capture. On denial the settings pane is opened once and
/// the run fails with `CaptureUnavailable`; platforms without the permission
/// pass.
pub fn ensure_screen_recording() -> TrackerResult<()> {
    ensure_with(screen_recording_status(), open_settings_pane)
}

fn ensure_with(
    status: ScreenRecordingStatus,
    open_settings: impl FnOnce() -> std::io::Result<()>,
) -> TrackerResult<()> {
    match status {
        ScreenRecordingStatus::Granted | ScreenRecordingStatus::NotSupported => Ok(()),
        ScreenRecordingStatus::Denied => {
            if let Err(err) = open_settings() {
                tracing::warn!(error = %err, "could not open the Screen Recording settings pane");
            }
            Err(TrackerError::CaptureUnavailable(format!(
                "Screen Recording permission is denied: {HELP}"
            )))
        }
    }
}

fn open_settings_pane() -> std::io::Result<()> {
    let status = std::process::Command::new("open").arg(SETTINGS_PANE).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("`open` exited with {status}")))
    }
}

#[cfg(target_os = "macos")]
#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    fn CGPreflightScreenCaptureAccess() -> bool;
}
