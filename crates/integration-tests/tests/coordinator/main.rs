#![allow(unused_crate_dependencies, clippy::panic)]

mod defer;
mod json;
mod stream;
mod subscriptions;
