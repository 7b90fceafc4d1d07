//! Coordinate engine, configuration and the map controller.

pub mod config;
pub mod constants;
pub mod geo;
pub mod map;
