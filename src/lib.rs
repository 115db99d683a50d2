pub mod branches;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod coverage;
pub mod error;
pub mod exec;
pub mod isolate;
pub mod lang;
pub mod model;
pub mod report;
pub mod runner;
pub mod structure;
pub mod synth;
pub mod template;
