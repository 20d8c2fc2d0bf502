use std::time::Duration;

use gpib_sorter::bridge::{GpibBridge, RetryPolicy};
use gpib_sorter::handler::{
    binon_command, run_job, BinConfig, JobOptions, JobSpec, PollConfig, SortSession, StatusPoller,
};
use gpib_sorter::ids::AcceptedIdSet;
use gpib_sorter::serial::{ConnectionConfig, MockPort, SerialInterface};

fn fast_connection() -> ConnectionConfig {
    ConnectionConfig { port: "mock".into(), settle_delay_ms: 0, reader_poll_ms: 1, ..ConnectionConfig::default() }
}

fn fast_poll() -> PollConfig {
    PollConfig { interval_ms: 1, max_polls: 200, max_unreadable: 10, clear_before_poll: false }
}

async fn bridge(mock: &MockPort) -> GpibBridge {
    let transport = SerialInterface::open_with(Box::new(mock.clone()), &fast_connection()).await.unwrap();
    let policy = RetryPolicy { settle_ms: 5, base_delay_ms: 2, max_attempts: 3, identify_settle_ms: 0, ..RetryPolicy::default() };
    GpibBridge::new(transport, policy)
}

fn handler(qrc: &str) -> MockPort {
    let mock = MockPort::new()
        .reply("CONFIGURE,SRQ=Y", "CONFIGURE,SRQ=Y:OK")
        .reply("CONFIGURE,FULLSITES?=Y", "CONFIGURE,FULLSITES?=Y:OK")
        .reply("CONFIGURE,CONTACTOR=Y", "CONFIGURE,CONTACTOR=Y:OK")
        .reply("QRM?", "QRM:1")
        .reply("++read", "CHECKEMPTY")
        .reply("FULLSITES?", "Fullsites 00000001")
        .reply("QRC?", qrc);
    (0..=9).fold(mock, |mock, bin| mock.reply(&binon_command(bin), "ECHO"))
}

fn session(accepted: &str) -> SortSession {
    SortSession::new(AcceptedIdSet::from_delimited(accepted), BinConfig::default())
        .with_inter_command_delay(Duration::ZERO)
}

#[tokio::test]
async fn part_ready_skips_empty_check() {
    let mock = handler("QRC:141JWWY043060M,1").reply("++spoll", "65");
    let mut bridge = bridge(&mock).await;
    let mut poller = StatusPoller::new(fast_poll());

    session("141JWWY043060M").run_cycle(&mut bridge, &mut poller).await.unwrap();

    let commands = mock.commands();
    assert_eq!(commands[0], "++spoll");
    assert_eq!(commands[1], "FULLSITES?");
    assert_eq!(mock.count("++read"), 0);
}

#[tokio::test]
async fn empty_check_is_acknowledged_then_polling_resumes() {
    let mock = handler("QRC:141JWWY043060M,1").reply_sequence("++spoll", &["68", "65"]);
    let mut bridge = bridge(&mock).await;
    let mut poller = StatusPoller::new(fast_poll());

    session("141JWWY043060M").run_cycle(&mut bridge, &mut poller).await.unwrap();

    assert_eq!(&mock.commands()[..5], ["++spoll", "++read", "ECHOOK", "++spoll", "FULLSITES?"]);
}

#[tokio::test]
async fn accepted_identifier_goes_to_pass_bin() {
    let mock = handler("QRC:141JWWY043060M,1").reply("++spoll", "65");
    let mut bridge = bridge(&mock).await;
    let mut poller = StatusPoller::new(fast_poll());

    let assignment = session("141JWWY043060M").run_cycle(&mut bridge, &mut poller).await.unwrap();

    assert_eq!(assignment.bin, 1);
    assert_eq!(mock.count("BINON:00000000,00000000,00000000,00000001"), 1);
    assert_eq!(mock.count("BINON:00000000,00000000,00000000,00000002"), 0);
}

#[tokio::test]
async fn unknown_identifier_goes_to_fail_bin() {
    let mock = handler("QRC:141JWWY043060M,1").reply("++spoll", "65");
    let mut bridge = bridge(&mock).await;
    let mut poller = StatusPoller::new(fast_poll());

    let assignment = session("141JWWY01D070P").run_cycle(&mut bridge, &mut poller).await.unwrap();

    assert_eq!(assignment.bin, 2);
    assert_eq!(mock.count("BINON:00000000,00000000,00000000,00000002"), 1);
}

#[tokio::test]
async fn bad_sites_reply_is_retried_exactly_once() {
    let mock = handler("QRC:141JWWY043060M,1")
        .reply("++spoll", "65")
        .reply_once("FULLSITES?", "SITES?");
    let mut bridge = bridge(&mock).await;
    let mut poller = StatusPoller::new(fast_poll());

    session("141JWWY043060M").run_cycle(&mut bridge, &mut poller).await.unwrap();

    assert_eq!(mock.count("FULLSITES?"), 2);
    assert_eq!(mock.count("QRC?"), 1);
}

#[tokio::test]
async fn pause_and_resume_bracket_the_decision() {
    let mock = handler("QRC:141JWWY043060M,1").reply("++spoll", "65");
    let mut bridge = bridge(&mock).await;
    let mut poller = StatusPoller::new(fast_poll());

    session("141JWWY043060M").run_cycle(&mut bridge, &mut poller).await.unwrap();

    let commands = mock.commands();
    let pos = |c: &str| commands.iter().position(|x| x == c).unwrap();
    assert!(pos("QRC?") < pos("PAUSE"));
    assert!(pos("PAUSE") < pos("RESUME"));
    assert!(pos("RESUME") < pos(&binon_command(1)));
    assert_eq!(commands.last().map(String::as_str), Some("ECHOOK"));
}

#[tokio::test]
async fn full_job_over_mock_handler() {
    let mock = handler("QRC:141JWWY043060M,1")
        .reply_sequence("++spoll", &["0", "68"])
        .reply("++spoll", "65")
        .reply_sequence("QRC?", &["QRC:141JWWY043060M,1", "QRC:141JWWY0890A0J,1", "QRC:141JWWY01D070P,1"]);
    let mut bridge = bridge(&mock).await;

    let accepted = AcceptedIdSet::from_delimited("141JWWY043060M\n141JWWY01D070P\n141JWWY0910308");
    let spec = JobSpec { num_parts: 3, ..JobSpec::for_accepted(1, accepted, BinConfig::default()) };
    let options = JobOptions { poll: fast_poll(), inter_command_delay_ms: 0, ..JobOptions::default() };

    let report = run_job(&mut bridge, &spec, &options).await.unwrap();

    let bins: Vec<u8> = report.sorted.iter().map(|a| a.bin).collect();
    assert_eq!(bins, vec![1, 2, 1]);
    assert_eq!((report.passed, report.failed), (2, 1));
    assert_eq!(mock.count("REQUEST,CHECKEMPTY"), 1);
    assert_eq!(mock.count("RESUME"), 3);
}
