pub mod control;
pub mod remote;
pub mod run;
