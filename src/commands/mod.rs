pub mod status;
pub mod watch;
