pub mod command;
pub mod file;
pub mod statement;
pub mod system;
