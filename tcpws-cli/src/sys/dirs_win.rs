extern crate dirs_sys;

use std::path::PathBuf;

/// The roaming `AppData` folder.
pub fn config_dir() -> Option<PathBuf> {
    dirs_sys::known_folder_roaming_app_data()
}
