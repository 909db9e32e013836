//! Risk-gated trade execution controller.
//!
//! Sits between a signal feed and an execution backend. Every fire request
//! passes the emergency stops and the per-user risk policy before an order
//! is submitted, and every admitted order is watched until its single
//! result arrives or the wait times out.

pub mod backend;
pub mod clock;
pub mod config;
pub mod confirm;
pub mod controller;
pub mod domain;
pub mod emergency;
pub mod gateway;
pub mod notification;
pub mod risk;
pub mod storage;
