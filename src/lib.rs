pub mod engine;
pub mod fill;
pub mod funscript;
pub mod interpolation;
pub mod pattern;
pub mod playback;
pub mod random_pattern;
pub mod tcode;
pub mod ticker;
pub mod transport;
pub mod types;
