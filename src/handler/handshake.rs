use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::bridge::GpibBridge;
use crate::events::EventKind;
use super::{HandlerError, Result, SrqEvent, StatusPoller};

/// Command and exact acknowledgement for each configuration step, in order
pub const CONFIGURATION_STEPS: [(&str, &str); 4] = [
    ("CONFIGURE,SRQ=Y", "CONFIGURE,SRQ=Y:OK"),
    ("CONFIGURE,FULLSITES?=Y", "CONFIGURE,FULLSITES?=Y:OK"),
    ("CONFIGURE,CONTACTOR=Y", "CONFIGURE,CONTACTOR=Y:OK"),
    // handler can read 2D identifiers
    ("QRM?", "QRM:1"),
];

pub const CHECK_EMPTY_REQUEST: &str = "REQUEST,CHECKEMPTY";
pub const CHECK_EMPTY: &str = "CHECKEMPTY";
pub const ECHO_OK: &str = "ECHOOK";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeOptions {
    /// Bound on the whole handshake, including the wait for the empty-socket SRQ
    pub timeout_ms: Option<u64>,
    /// Set the adapter's auto-read mode before configuring; left as-is when `None`
    pub auto_read: Option<bool>,
}

impl HandshakeOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Bring the handler at `address` into a known ready state.
///
/// Addresses and clears the handler, runs [`CONFIGURATION_STEPS`], then requests the empty-socket
/// check and acknowledges it once the handler raises SRQ 0x44.
pub async fn configure(
    bridge: &mut GpibBridge,
    poller: &mut StatusPoller,
    address: u8,
    options: &HandshakeOptions,
) -> Result<()> {
    let handshake = async {
        bridge.set_address(address).await?;
        bridge.clear().await?;
        bridge.transport().clear().await;

        if let Some(auto_read) = options.auto_read {
            bridge.set_auto_read_mode(auto_read).await?;
        }

        run_configuration_steps(bridge).await?;
        request_empty_check(bridge, poller).await?;

        bridge.emit(EventKind::ConfigurationComplete { address });
        log::info!("Handler at GPIB address {} configured", address);
        Ok::<(), HandlerError>(())
    };

    match options.timeout() {
        Some(limit) => tokio::time::timeout(limit, handshake).await.map_err(|_| HandlerError::Timeout {
            operation: "configuring handler".to_string(),
            waited: limit,
        })?,
        None => handshake.await,
    }
}

/// Steps 1-4 of the handshake. Any acknowledgement other than the exact expected text aborts.
pub async fn run_configuration_steps(bridge: &mut GpibBridge) -> Result<()> {
    for (command, expected) in CONFIGURATION_STEPS {
        expect_exact(bridge, command, expected).await?;
    }
    Ok(())
}

/// Send `command` and require `expected` back verbatim
pub async fn expect_exact(bridge: &mut GpibBridge, command: &str, expected: &str) -> Result<String> {
    let response = bridge.query(command).await?;
    match response {
        Some(actual) if actual == expected => Ok(actual),
        other => Err(HandlerError::mismatch(command, expected, other.as_deref())),
    }
}

async fn request_empty_check(bridge: &mut GpibBridge, poller: &mut StatusPoller) -> Result<()> {
    bridge.send(CHECK_EMPTY_REQUEST).await?;
    log::info!("Waiting for empty-socket check SRQ...");
    poller.wait_for(bridge, |event| event == SrqEvent::EmptyCheck).await?;
    acknowledge_empty_check(bridge).await
}

/// Read the `CHECKEMPTY` message the handler holds after SRQ 0x44 and answer `ECHOOK`
pub async fn acknowledge_empty_check(bridge: &mut GpibBridge) -> Result<()> {
    bridge.request_read().await?;
    let response = bridge.read_response().await?;
    if response.as_deref() != Some(CHECK_EMPTY) {
        return Err(HandlerError::mismatch("++read", CHECK_EMPTY, response.as_deref()));
    }
    bridge.send(ECHO_OK).await?;
    Ok(())
}

/// `SRQKIND?`: `true` once the handler reports the lot is finished
pub async fn lot_finished(bridge: &mut GpibBridge) -> Result<bool> {
    let response = bridge.query("SRQKIND?").await?;
    match response.as_deref() {
        Some("SRQKIND 2") => Ok(false),
        Some("SRQKIND 8") => Ok(true),
        other => Err(HandlerError::mismatch("SRQKIND?", "SRQKIND 2|SRQKIND 8", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockPort;
    use crate::test_support::{bridge_over, configured_handler, fast_poll, handler_acks};

    #[tokio::test]
    async fn test_full_handshake() {
        let mock = configured_handler();
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());

        configure(&mut bridge, &mut poller, 1, &HandshakeOptions::default()).await.unwrap();

        assert_eq!(
            mock.commands(),
            vec![
                "++addr 1",
                "++clr",
                "CONFIGURE,SRQ=Y",
                "CONFIGURE,FULLSITES?=Y",
                "CONFIGURE,CONTACTOR=Y",
                "QRM?",
                "REQUEST,CHECKEMPTY",
                "++spoll",
                "++spoll",
                "++read",
                "ECHOOK",
            ]
        );
    }

    #[tokio::test]
    async fn test_auto_read_set_before_configuring() {
        let mock = configured_handler();
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());
        let options = HandshakeOptions { timeout_ms: None, auto_read: Some(false) };

        configure(&mut bridge, &mut poller, 1, &options).await.unwrap();
        assert_eq!(&mock.commands()[..4], ["++addr 1", "++clr", "++auto 0", "CONFIGURE,SRQ=Y"]);
    }

    #[tokio::test]
    async fn test_configuration_steps_are_repeatable() {
        let mock = configured_handler();
        let mut bridge = bridge_over(&mock).await;

        run_configuration_steps(&mut bridge).await.unwrap();
        run_configuration_steps(&mut bridge).await.unwrap();
        assert_eq!(mock.count("QRM?"), 2);
    }

    #[tokio::test]
    async fn test_mismatch_aborts_handshake() {
        let mock = MockPort::new()
            .reply("CONFIGURE,SRQ=Y", "CONFIGURE,SRQ=Y:OK")
            .reply("CONFIGURE,FULLSITES?=Y", "CONFIGURE,FULLSITES?=Y:NG");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());

        let err = configure(&mut bridge, &mut poller, 1, &HandshakeOptions::default()).await.unwrap_err();
        match err {
            HandlerError::ProtocolMismatch { command, expected, actual } => {
                assert_eq!(command, "CONFIGURE,FULLSITES?=Y");
                assert_eq!(expected, "CONFIGURE,FULLSITES?=Y:OK");
                assert_eq!(actual, "CONFIGURE,FULLSITES?=Y:NG");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.count("CONFIGURE,CONTACTOR=Y"), 0);
    }

    #[tokio::test]
    async fn test_qrm_capability_required() {
        let mock = configured_handler().reply("QRM?", "QRM:0");
        let mut bridge = bridge_over(&mock).await;

        let err = run_configuration_steps(&mut bridge).await.unwrap_err();
        assert!(matches!(err, HandlerError::ProtocolMismatch { ref actual, .. } if actual == "QRM:0"));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let mock = handler_acks().reply("++spoll", "0");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());
        let options = HandshakeOptions { timeout_ms: Some(60), auto_read: None };

        let err = configure(&mut bridge, &mut poller, 1, &options).await.unwrap_err();
        assert!(matches!(err, HandlerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_check_needs_checkempty_message() {
        let mock = MockPort::new().reply("++read", "SOMETHING ELSE");
        let mut bridge = bridge_over(&mock).await;

        let err = acknowledge_empty_check(&mut bridge).await.unwrap_err();
        assert!(matches!(err, HandlerError::ProtocolMismatch { .. }));
        assert_eq!(mock.count("ECHOOK"), 0);
    }

    #[tokio::test]
    async fn test_lot_finished() {
        let mock = MockPort::new().reply_sequence("SRQKIND?", &["SRQKIND 2", "SRQKIND 8", "SRQKIND 5"]);
        let mut bridge = bridge_over(&mock).await;

        assert!(!lot_finished(&mut bridge).await.unwrap());
        assert!(lot_finished(&mut bridge).await.unwrap());
        assert!(lot_finished(&mut bridge).await.is_err());
    }
}
