pub mod classifier;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod frame;
pub mod frame_lease;
pub mod frame_store;
pub mod logging;
pub mod model;
pub mod paths;
pub mod permissions;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod timeline;
pub mod tracker;
