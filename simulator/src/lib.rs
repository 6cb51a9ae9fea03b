//! Traffic Generators
//!
//! Companion programs for exercising the baseband unit: a paced packet
//! sender that replays prepared IQ as a live base station would see it, a
//! channel simulator relaying UE-side traffic through a random MIMO
//! channel, and the offline generator that produces the IQ and reference
//! files both of them (and the tests) consume.

pub mod chsim;
pub mod datagen;
pub mod sender;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] common::config::ConfigError),

    #[error("missing input data: {0}")]
    MissingData(String),
}
