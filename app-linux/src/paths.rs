use std::path::PathBuf;

use proxy_box_core::platform::AppPaths;

const APP_DIR: &str = "proxy_box";

#[derive(Default)]
pub struct LinuxPaths;

impl AppPaths for LinuxPaths {
    fn base_dir(&self) -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    fn temp_dir(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR)
    }

    fn config_path(&self) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }
}
