pub mod builder;
pub mod phylogenetic;
pub mod runner;
