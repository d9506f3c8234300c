//! # UAVTalk GCS Library
//!
//! Ground-station side of the UAVTalk telemetry protocol.
//!
//! This library provides the object model shared with the flight controller
//! (typed UAVObjects, their metadata and the object manager), the UAVTalk
//! wire codec, and the telemetry engine that runs acked writes, requests and
//! periodic updates over a serial or TCP link.

pub mod config;
pub mod error;
pub mod link;
pub mod telemetry;
pub mod uavobject;
pub mod uavobjects;
pub mod uavtalk;
