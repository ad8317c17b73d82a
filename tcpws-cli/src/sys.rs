//! Platform lookups for where the per-user config file lives.

#[cfg_attr(target_os = "windows", path = "sys/dirs_win.rs")]
#[cfg_attr(not(target_os = "windows"), path = "sys/dirs_unix.rs")]
pub(crate) mod dirs;
