//! Core of the footprint analytics engine: session assembly, identity
//! resolution, funnel evaluation and journey reconstruction over an
//! [`EventStore`](store::EventStore).

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod funnel;
pub mod identity;
pub mod journey;
pub mod locks;
pub mod session;
pub mod store;
pub mod window;
