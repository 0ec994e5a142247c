//! Chat composition: controller and voice text shaping

mod controller;
pub mod voice;

pub use controller::{ChatConfig, ChatController, TIMEOUT_DIAGNOSTIC};
