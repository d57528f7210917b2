pub mod command;
pub mod file;
pub mod runner;
pub mod sambam;
pub mod staging;
pub mod system;
