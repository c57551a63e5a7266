//! Integration tests for tide-bot.
//!
//! These tests drive the dispatcher over real HTTP:
//! - Webhook delivery, retry and fallback through `WebhookTransport`
//! - Mirroring and cascade dispatch end to end
//! - The HTTP API served by `Application`

pub mod common;
