pub mod aoi;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fs_util;
pub mod geohash;
pub mod geometry;
pub mod manifest;
pub mod organizer;
pub mod output;
pub mod source;
pub mod store;
pub mod tiler;
pub mod window;
