mod fs_utils;
mod layout;
mod manager;

pub use fs_utils::{quarantine_file, remove_dir_if_empty, remove_file_if_exists};
pub use layout::{default_machine_root, default_user_root, CacheLayout};
pub use manager::{CacheManager, ElevationDelegate};

#[cfg(test)]
mod tests;
