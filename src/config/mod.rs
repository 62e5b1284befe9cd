pub mod defs;
pub mod executables;
