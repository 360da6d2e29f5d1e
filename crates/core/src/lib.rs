//! Domain logic for blind A/B evaluation of model-generated video
//! descriptions.
//!
//! Everything here is synchronous and side-effect free except the
//! [`storage`] abstraction and the [`ledger`] built on top of it. The
//! concurrent parts (dispatch, inference, rendering) live in
//! `blindeval-pipeline`.

pub mod analysis;
pub mod batch;
pub mod blinding;
pub mod error;
pub mod hashing;
pub mod judgment;
pub mod ledger;
pub mod output;
pub mod sampling;
pub mod stats;
pub mod storage;
pub mod subtitles;
pub mod types;
