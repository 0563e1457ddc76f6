use std::path::{Path, PathBuf};

const APP_DIR: &str = "screen-timeline";

pub fn default_data_dir() -> PathBuf {
    let path = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);
    let _ = std::fs::create_dir_all(&path);
    path
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sessions.json")
}

/// One JSON-lines log of samples and analyses per session.
pub fn samples_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("samples")
}

pub fn captures_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("captures")
}

pub fn lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join("capture.lock")
}

pub fn report_path(data_dir: &Path) -> PathBuf {
    data_dir.join("reports.md")
}

#[cfg(test)]
mod tests {
    use super::{captures_dir, lock_path, report_path, samples_dir, store_path};
    use std::path::Path;

    #[test]
    fn layout_lives_under_the_data_dir() {
        let root = Path::new("/data/screen-timeline");
        assert_eq!(store_path(root), root.join("sessions.json"));
        assert_eq!(samples_dir(root), root.join("samples"));
        assert_eq!(captures_dir(root), root.join("captures"));
        assert_eq!(lock_path(root), root.join("capture.lock"));
        assert_eq!(report_path(root), root.join("reports.md"));
    }
}
