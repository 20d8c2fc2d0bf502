use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::bridge::GpibBridge;
use crate::ids::AcceptedIdSet;
use super::handshake::{acknowledge_empty_check, ECHO_OK};
use super::{HandlerError, Result, SrqEvent, StatusPoller};

/// Highest bin number a `BINON` command can carry
pub const MAX_BIN: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortState {
    WaitSrq,
    QuerySites,
    QueryId,
    Pause,
    AwaitBinDecision,
    Resume,
    WriteBin,
    EchoAck,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinConfig {
    pub pass_bin: u8,
    pub fail_bin: u8,
}

impl Default for BinConfig {
    fn default() -> Self {
        Self { pass_bin: 1, fail_bin: 2 }
    }
}

impl BinConfig {
    pub fn new(pass_bin: u8, fail_bin: u8) -> Result<Self> {
        let bins = Self { pass_bin, fail_bin };
        bins.validate()?;
        Ok(bins)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, bin) in [("pass", self.pass_bin), ("fail", self.fail_bin)] {
            if bin > MAX_BIN {
                return Err(HandlerError::InvalidBins(format!("{} bin {} out of range 0-{}", name, bin, MAX_BIN)));
            }
        }
        if self.pass_bin == self.fail_bin {
            return Err(HandlerError::InvalidBins(format!("pass and fail bin are both {}", self.pass_bin)));
        }
        Ok(())
    }
}

/// Outcome of one sort cycle. `identifier` is `None` when the handler's reader gave nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinAssignment {
    pub identifier: Option<String>,
    pub bin: u8,
}

/// `pass_bin` iff `identifier` is in `accepted`
pub fn decide(identifier: &str, accepted: &AcceptedIdSet, pass_bin: u8, fail_bin: u8) -> u8 {
    if accepted.contains(identifier) {
        pass_bin
    } else {
        fail_bin
    }
}

pub type DecisionError = Box<dyn std::error::Error + Send + Sync>;

/// Chooses the bin for an identified part while the handler is paused
pub trait BinDecider: Send + Sync {
    fn decide(&self, identifier: &str, bins: &BinConfig) -> std::result::Result<u8, DecisionError>;
}

/// Pass when the identifier is in the job's accepted set
pub struct AcceptedSetDecider {
    accepted: AcceptedIdSet,
}

impl AcceptedSetDecider {
    pub fn new(accepted: AcceptedIdSet) -> Self {
        Self { accepted }
    }

    pub fn accepted(&self) -> &AcceptedIdSet {
        &self.accepted
    }
}

impl BinDecider for AcceptedSetDecider {
    fn decide(&self, identifier: &str, bins: &BinConfig) -> std::result::Result<u8, DecisionError> {
        Ok(decide(identifier, &self.accepted, bins.pass_bin, bins.fail_bin))
    }
}

/// Identifier between the first `:` and the following `,` of a `QRC:` reply
pub fn parse_identifier(response: &str) -> Option<String> {
    let (_, rest) = response.split_once(':')?;
    let id = rest.split(',').next().unwrap_or(rest).trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Site 4 carries the bin; sites 1-3 are unused
pub fn binon_command(bin: u8) -> String {
    format!("BINON:00000000,00000000,00000000,{:08}", bin)
}

/// Per-part sort state machine for one handler
pub struct SortSession {
    state: SortState,
    failed_at: Option<SortState>,
    decider: Box<dyn BinDecider>,
    bins: BinConfig,
    last_identifier: Option<String>,
    srq_consumed: bool,
    inter_command_delay: Duration,
}

impl SortSession {
    pub fn new(accepted: AcceptedIdSet, bins: BinConfig) -> Self {
        Self::with_decider(Box::new(AcceptedSetDecider::new(accepted)), bins)
    }

    pub fn with_decider(decider: Box<dyn BinDecider>, bins: BinConfig) -> Self {
        Self {
            state: SortState::WaitSrq,
            failed_at: None,
            decider,
            bins,
            last_identifier: None,
            srq_consumed: false,
            inter_command_delay: Duration::from_millis(200),
        }
    }

    /// Pause after `FULLSITES?` and after `RESUME` so the handler can finish moving
    pub fn with_inter_command_delay(mut self, delay: Duration) -> Self {
        self.inter_command_delay = delay;
        self
    }

    pub fn state(&self) -> SortState {
        self.state
    }

    /// State the last failed cycle was in when it aborted
    pub fn failed_at(&self) -> Option<SortState> {
        self.failed_at
    }

    pub fn bins(&self) -> &BinConfig {
        &self.bins
    }

    pub fn last_identifier(&self) -> Option<&str> {
        self.last_identifier.as_deref()
    }

    pub fn srq_consumed(&self) -> bool {
        self.srq_consumed
    }

    /// The caller already saw the part-ready SRQ; the next cycle skips polling
    pub fn mark_srq_consumed(&mut self) {
        self.srq_consumed = true;
    }

    /// Sort one part. On error the session is left in [`SortState::Error`].
    pub async fn run_cycle(&mut self, bridge: &mut GpibBridge, poller: &mut StatusPoller) -> Result<BinAssignment> {
        self.failed_at = None;
        match self.cycle(bridge, poller).await {
            Ok(assignment) => {
                self.state = SortState::Done;
                Ok(assignment)
            }
            Err(e) => {
                log::error!("Sort cycle aborted in {:?}: {}", self.state, e);
                self.failed_at = Some(self.state);
                self.state = SortState::Error;
                Err(e)
            }
        }
    }

    async fn cycle(&mut self, bridge: &mut GpibBridge, poller: &mut StatusPoller) -> Result<BinAssignment> {
        self.state = SortState::WaitSrq;
        if std::mem::take(&mut self.srq_consumed) {
            log::debug!("Part-ready SRQ already consumed, skipping status poll");
        } else {
            wait_for_part(bridge, poller).await?;
        }

        self.state = SortState::QuerySites;
        query_expecting(bridge, "FULLSITES?", "Fullsites").await?;
        sleep(self.inter_command_delay).await;

        self.state = SortState::QueryId;
        let response = query_expecting(bridge, "QRC?", "QRC:").await?;
        let identifier = response
            .as_deref()
            .filter(|r| r.starts_with("QRC:"))
            .and_then(parse_identifier);
        match &identifier {
            Some(id) => log::info!("Device identifier: {}", id),
            None => log::warn!("No device identifier in {:?}, part goes to the fail bin", response),
        }
        self.last_identifier = identifier.clone();

        self.state = SortState::Pause;
        bridge.send("PAUSE").await?;

        self.state = SortState::AwaitBinDecision;
        let bin = self.decide_bin(identifier.as_deref());

        self.state = SortState::Resume;
        bridge.send("RESUME").await?;
        sleep(self.inter_command_delay).await;

        self.state = SortState::WriteBin;
        let command = binon_command(bin);
        let ack = bridge.query(&command).await?;
        if !ack.as_deref().is_some_and(|a| a.starts_with('E')) {
            log::warn!("Unexpected acknowledgement {:?} to {}, resending once", ack, command);
            let retry = bridge.query(&command).await?;
            log::debug!("Resent {} -> {:?}", command, retry);
        }

        self.state = SortState::EchoAck;
        bridge.send(ECHO_OK).await?;
        bridge.transport().clear().await;

        log::info!("Part sorted to bin {}", bin);
        Ok(BinAssignment { identifier, bin })
    }

    /// Unreadable identifiers and decider failures both go to the fail bin
    fn decide_bin(&self, identifier: Option<&str>) -> u8 {
        let fail = self.bins.fail_bin;
        let Some(identifier) = identifier else { return fail };

        match catch_unwind(AssertUnwindSafe(|| self.decider.decide(identifier, &self.bins))) {
            Ok(Ok(bin)) if bin == self.bins.pass_bin || bin == fail => bin,
            Ok(Ok(bin)) => {
                log::warn!("Decider chose bin {} for {}, which is neither pass nor fail bin", bin, identifier);
                fail
            }
            Ok(Err(e)) => {
                log::warn!("Bin decision for {} failed: {}", identifier, e);
                fail
            }
            Err(_) => {
                log::error!("Bin decision for {} panicked", identifier);
                fail
            }
        }
    }
}

/// Poll until a part is ready, acknowledging any empty-socket checks on the way
async fn wait_for_part(bridge: &mut GpibBridge, poller: &mut StatusPoller) -> Result<()> {
    loop {
        let event = poller
            .wait_for(bridge, |e| matches!(e, SrqEvent::PartReady | SrqEvent::EmptyCheck))
            .await?;
        if event == SrqEvent::PartReady {
            return Ok(());
        }
        acknowledge_empty_check(bridge).await?;
    }
}

/// Query with a single retry when the reply lacks `prefix`. The second reply is returned as-is.
async fn query_expecting(bridge: &mut GpibBridge, command: &str, prefix: &str) -> Result<Option<String>> {
    let first = bridge.query(command).await?;
    if first.as_deref().is_some_and(|r| r.starts_with(prefix)) {
        return Ok(first);
    }

    log::warn!("'{}' answered {:?}, expected '{}...', retrying once", command, first, prefix);
    let second = bridge.query(command).await?;
    if !second.as_deref().is_some_and(|r| r.starts_with(prefix)) {
        log::warn!("'{}' still answered {:?}, continuing", command, second);
    }
    Ok(second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockPort;
    use crate::test_support::{bridge_over, fast_poll, sorting_handler};

    fn session(ids: &[&str]) -> SortSession {
        SortSession::new(ids.iter().collect(), BinConfig::default()).with_inter_command_delay(Duration::ZERO)
    }

    #[test]
    fn test_decide() {
        let accepted: AcceptedIdSet = ["141JWWY043060M", "141JWWY01D070P"].into_iter().collect();
        for id in ["141JWWY043060M", "141JWWY01D070P"] {
            assert_eq!(decide(id, &accepted, 1, 2), 1);
        }
        for id in ["141JWWY0890A0J", "", "141jwwy043060m"] {
            assert_eq!(decide(id, &accepted, 1, 2), 2);
        }
        assert_eq!(decide("141JWWY043060M", &AcceptedIdSet::new(), 1, 2), 2);
    }

    #[test]
    fn test_binon_command() {
        assert_eq!(binon_command(1), "BINON:00000000,00000000,00000000,00000001");
        assert_eq!(binon_command(2), "BINON:00000000,00000000,00000000,00000002");
        assert_eq!(binon_command(9).len(), "BINON:".len() + 35);
    }

    #[test]
    fn test_parse_identifier() {
        assert_eq!(parse_identifier("QRC:141JWWY043060M,1").as_deref(), Some("141JWWY043060M"));
        assert_eq!(parse_identifier("QRC:141JWWY043060M").as_deref(), Some("141JWWY043060M"));
        assert_eq!(parse_identifier("QRC:,1"), None);
        assert_eq!(parse_identifier("QRC"), None);
    }

    #[test]
    fn test_bin_config_validation() {
        assert!(BinConfig::new(1, 2).is_ok());
        assert!(matches!(BinConfig::new(3, 3), Err(HandlerError::InvalidBins(_))));
        assert!(matches!(BinConfig::new(1, 10), Err(HandlerError::InvalidBins(_))));
    }

    #[tokio::test]
    async fn test_part_ready_goes_straight_to_sites() {
        let mock = sorting_handler("QRC:141JWWY043060M,1").reply("++spoll", "65");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());
        let mut session = session(&["141JWWY043060M"]);

        let assignment = session.run_cycle(&mut bridge, &mut poller).await.unwrap();

        assert_eq!(assignment, BinAssignment { identifier: Some("141JWWY043060M".into()), bin: 1 });
        assert_eq!(session.state(), SortState::Done);
        assert_eq!(
            mock.commands(),
            vec![
                "++spoll",
                "FULLSITES?",
                "QRC?",
                "PAUSE",
                "RESUME",
                "BINON:00000000,00000000,00000000,00000001",
                "ECHOOK",
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_check_then_part() {
        let mock = sorting_handler("QRC:141JWWY043060M,1")
            .reply_sequence("++spoll", &["68", "0", "65"])
            .reply("++read", "CHECKEMPTY");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());
        let mut session = session(&[]);

        let assignment = session.run_cycle(&mut bridge, &mut poller).await.unwrap();

        assert_eq!(assignment.bin, 2);
        assert_eq!(&mock.commands()[..6], ["++spoll", "++read", "ECHOOK", "++spoll", "++spoll", "FULLSITES?"]);
    }

    #[tokio::test]
    async fn test_sites_mismatch_retries_once() {
        let mock = sorting_handler("QRC:141JWWY043060M,1")
            .reply("++spoll", "65")
            .reply_once("FULLSITES?", "GARBAGE");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());

        session(&["141JWWY043060M"]).run_cycle(&mut bridge, &mut poller).await.unwrap();
        assert_eq!(mock.count("FULLSITES?"), 2);
    }

    #[tokio::test]
    async fn test_sites_mismatch_twice_proceeds() {
        let mock = sorting_handler("QRC:141JWWY043060M,1")
            .reply("++spoll", "65")
            .reply("FULLSITES?", "GARBAGE");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());

        let assignment = session(&["141JWWY043060M"]).run_cycle(&mut bridge, &mut poller).await.unwrap();
        assert_eq!(mock.count("FULLSITES?"), 2);
        assert_eq!(assignment.bin, 1);
    }

    #[tokio::test]
    async fn test_unreadable_identifier_fails_part() {
        let mock = sorting_handler("NOREAD").reply("++spoll", "65");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());
        let mut session = session(&["141JWWY043060M"]);

        let assignment = session.run_cycle(&mut bridge, &mut poller).await.unwrap();
        assert_eq!(assignment, BinAssignment { identifier: None, bin: 2 });
        assert_eq!(mock.count("QRC?"), 2);
        assert_eq!(mock.count("RESUME"), 1);
    }

    #[tokio::test]
    async fn test_binon_resent_without_e_ack() {
        let mock = sorting_handler("QRC:141JWWY043060M,1")
            .reply("++spoll", "65")
            .reply("BINON:00000000,00000000,00000000,00000001", "?");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());

        session(&["141JWWY043060M"]).run_cycle(&mut bridge, &mut poller).await.unwrap();
        assert_eq!(mock.count("BINON:00000000,00000000,00000000,00000001"), 2);
        assert_eq!(mock.count("ECHOOK"), 1);
    }

    #[tokio::test]
    async fn test_consumed_srq_skips_poll() {
        let mock = sorting_handler("QRC:141JWWY043060M,1");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());
        let mut session = session(&["141JWWY043060M"]);
        session.mark_srq_consumed();

        session.run_cycle(&mut bridge, &mut poller).await.unwrap();
        assert_eq!(mock.count("++spoll"), 0);
        assert!(!session.srq_consumed());
    }

    struct Failing;

    impl BinDecider for Failing {
        fn decide(&self, _identifier: &str, _bins: &BinConfig) -> std::result::Result<u8, DecisionError> {
            Err("operator cancelled".into())
        }
    }

    struct Panicking;

    impl BinDecider for Panicking {
        fn decide(&self, _identifier: &str, _bins: &BinConfig) -> std::result::Result<u8, DecisionError> {
            panic!("decider bug")
        }
    }

    #[tokio::test]
    async fn test_decider_failure_still_resumes() {
        let deciders: Vec<Box<dyn BinDecider>> = vec![Box::new(Failing), Box::new(Panicking)];
        for decider in deciders {
            let mock = sorting_handler("QRC:141JWWY043060M,1").reply("++spoll", "65");
            let mut bridge = bridge_over(&mock).await;
            let mut poller = StatusPoller::new(fast_poll());
            let mut session = SortSession::with_decider(decider, BinConfig::default())
                .with_inter_command_delay(Duration::ZERO);

            let assignment = session.run_cycle(&mut bridge, &mut poller).await.unwrap();
            assert_eq!(assignment.bin, 2);
            assert_eq!(mock.count("RESUME"), 1);
        }
    }

    #[tokio::test]
    async fn test_status_failure_leaves_error_state() {
        let mock = MockPort::new().reply("++spoll", "garbage");
        let mut bridge = bridge_over(&mock).await;
        let mut poller = StatusPoller::new(fast_poll());
        let mut session = session(&[]);

        let err = session.run_cycle(&mut bridge, &mut poller).await.unwrap_err();
        assert!(matches!(err, HandlerError::StatusRead { .. }));
        assert_eq!(session.state(), SortState::Error);
        assert_eq!(session.failed_at(), Some(SortState::WaitSrq));
    }
}
