//! Concurrent stages of the evaluation pipeline.
//!
//! Every stage that fans out over independent jobs (model inference,
//! video rendering) goes through the one [`dispatcher::TaskDispatcher`].

pub mod dispatcher;
pub mod ffmpeg;
pub mod inference;
pub mod model_client;
pub mod render;
