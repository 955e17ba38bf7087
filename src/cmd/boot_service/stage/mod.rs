pub mod detect_bootloader;
pub mod detect_persistence;
pub mod sync_daemon;
