pub mod admin;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod filter;
pub mod group;
pub mod hash;
pub mod listener;
pub mod pidfile;
pub mod proto;
pub mod relay;
pub mod sampler;
pub mod stats;
pub mod supervisor;
pub mod validate;

pub mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
