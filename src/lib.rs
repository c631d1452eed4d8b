//! Voiceprobe Core Library
//!
//! This library contains the session layer a conversation test harness uses to
//! talk to realtime voice AI providers: provider-specific protocol clients
//! speaking each provider's WebSocket wire format, and a session bridge that
//! serializes concurrent callers onto a single live provider connection. Turn
//! orchestration, moderation and test-case loading live in the harness on top
//! of this crate.

pub mod bridge;
pub mod config;
pub mod provider;
