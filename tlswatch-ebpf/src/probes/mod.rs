pub mod proc_watch;
pub mod ssl;
