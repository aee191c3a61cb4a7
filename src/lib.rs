pub mod config;
pub mod control;
pub mod overlay;
pub mod pose;
pub mod schedule;
pub mod settings;
pub mod tracker;
pub mod vmt;
