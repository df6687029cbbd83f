pub mod defs;
pub mod ini;
pub mod params;
