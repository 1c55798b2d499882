//! # bitvit-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`BitVitConfig`]**: model hyper-parameters and device (serialised as JSON).
//! * **[`DeviceChoice`]**: execution placement, resolved to a candle `Device`.
//! * **[`ImageDataset`]** / **[`BatchDataset`]**: CIFAR-10 loading & batching.
//! * **[`batch_to_tensors`]**: raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::{BitVitConfig, DeviceChoice};
pub use data::{
    batch_to_tensors, BatchDataset, Cifar10File, ImageBatch, ImageDataset, Split,
};
