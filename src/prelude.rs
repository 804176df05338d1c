//! Commonly imported types for use in applications embedding this crate.

pub use crate::{
    CardinalityPolicy, MetricsConfig, MetricsLayer, Registry, RequestLabels, Snapshot,
    VitalsError, VitalsHandle,
};
