//! Controller Runtime (C10): dependency-ordered startup/shutdown wiring the
//! Storage Engine, Schema Registry, Message Log, Broker Client, and the
//! application-layer processors together.

pub mod runtime;

pub use runtime::ControllerRuntime;
