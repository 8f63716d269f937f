pub mod cli;
pub mod config_store;
pub mod device;
pub mod device_set;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod mailbox;
pub mod observer;
pub mod recorder;
pub mod region;
pub mod sample;
pub mod sensor;
pub mod tracker;

/// A world- or device-frame 2D point, (x, y) in metres.
pub type Point2D = (f32, f32);
