//! `esgate-kernel`: contracts for the esgate protocol gateway.
//!
//! This crate holds the trait interfaces, request/response data types and
//! configuration shared by every gateway component. Concrete connectors,
//! routers, processors and the runtime live in `esgate-gateway`.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pipeline`] | request model, middleware / handler / processor / backend traits, build errors |
//! | [`ab_testing`] | A/B comparison records, health messages, `ResultSender` and `Collector` traits |
//! | [`config`] | multi-format config loader and [`GatewayConfig`](config::GatewayConfig) |

pub mod ab_testing;
pub mod config;
pub mod pipeline;
