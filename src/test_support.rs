//! Shared fixtures for unit tests: fast timings and a scripted handler
use crate::bridge::{GpibBridge, RetryPolicy};
use crate::config::SorterConfig;
use crate::handler::{PollConfig, CONFIGURATION_STEPS};
use crate::serial::{ConnectionConfig, MockPort, SerialInterface};

pub(crate) fn fast_connection() -> ConnectionConfig {
    ConnectionConfig {
        port: "mock".to_string(),
        settle_delay_ms: 0,
        reader_poll_ms: 1,
        close_timeout_ms: 100,
        ..ConnectionConfig::default()
    }
}

pub(crate) fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        settle_ms: 5,
        base_delay_ms: 2,
        max_attempts: 3,
        identify_settle_ms: 0,
        ..RetryPolicy::default()
    }
}

pub(crate) fn fast_poll() -> PollConfig {
    PollConfig {
        interval_ms: 1,
        max_polls: 200,
        max_unreadable: 10,
        clear_before_poll: false,
    }
}

pub(crate) fn fast_config() -> SorterConfig {
    SorterConfig {
        connection: fast_connection(),
        response: fast_policy(),
        polling: fast_poll(),
        inter_command_delay_ms: 0,
        ..SorterConfig::default()
    }
}

pub(crate) async fn bridge_over(mock: &MockPort) -> GpibBridge {
    let transport = SerialInterface::open_with(Box::new(mock.clone()), &fast_connection())
        .await
        .unwrap();
    GpibBridge::new(transport, fast_policy())
}

/// Acknowledges the four configuration steps
pub(crate) fn handler_acks() -> MockPort {
    CONFIGURATION_STEPS
        .iter()
        .fold(MockPort::new(), |mock, (command, ack)| mock.reply(command, ack))
}

/// Completes the whole handshake: one idle poll, then the empty-socket check
pub(crate) fn configured_handler() -> MockPort {
    handler_acks()
        .reply_sequence("++spoll", &["0", "68"])
        .reply("++read", "CHECKEMPTY")
}

/// Sort-cycle replies; `qrc` answers every `QRC?`
pub(crate) fn sort_replies(mock: MockPort, qrc: &str) -> MockPort {
    let mock = mock.reply("FULLSITES?", "Fullsites 00000001").reply("QRC?", qrc);
    (0..=9).fold(mock, |mock, bin| {
        mock.reply(&crate::handler::binon_command(bin), "ECHO")
    })
}

pub(crate) fn sorting_handler(qrc: &str) -> MockPort {
    sort_replies(MockPort::new(), qrc)
}
