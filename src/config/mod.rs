pub mod defs;
pub mod registry;
