pub mod config;
pub mod history;
pub mod run;
pub mod sync;
pub mod timer;
