mod client;

pub use client::{
    CurrentModeReport, HealthReport, ModeClient, ModeClientConfig, ModeNegotiator,
    ModeSwitchError, ModeSwitchOutcome,
};
