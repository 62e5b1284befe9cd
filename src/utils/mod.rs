pub mod command;
pub mod file;
pub mod graph;
pub mod paths;
pub mod phylip;
pub mod scheduler;
pub mod system;
pub mod template;
