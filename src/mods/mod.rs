pub mod audio;
pub mod chirp;
pub mod display;
pub mod engine;
pub mod recorder;
pub mod searcher;
pub mod simulated;
pub mod spectral;
