#![allow(dead_code)]

use lazy_static::lazy_static;
use regex::Regex;

use ssh_runner::{RunnerConfig, Session, SshRunner};

pub fn addr() -> String {
    std::env::var("TEST_HOST").unwrap_or("ssh://test-user@127.0.0.1:2222".to_string())
}

#[derive(Default, Debug, PartialEq, Eq)]
pub struct ProtoUserHostPort<'a> {
    pub proto: Option<&'a str>,
    pub user: Option<&'a str>,
    pub host: Option<&'a str>,
    pub port: Option<&'a str>,
}

pub fn parse_user_host_port(s: &str) -> Option<ProtoUserHostPort<'_>> {
    lazy_static! {
        static ref SSH_REGEX: Regex = Regex::new(
            r"(?x)^((?P<proto>[[:alpha:]]+)://)?((?P<user>.*?)@)?(?P<host>.*?)(:(?P<port>\d+))?$"
        )
        .unwrap();
    }
    SSH_REGEX.captures(s).map(|cap| ProtoUserHostPort {
        proto: cap.name("proto").map(|m| m.as_str()),
        user: cap.name("user").map(|m| m.as_str()),
        host: cap.name("host").map(|m| m.as_str()),
        port: cap.name("port").map(|m| m.as_str()),
    })
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ssh_runner=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn runner(config: RunnerConfig) -> SshRunner {
    init_logging();
    SshRunner::new(config)
}

/// Connect to the test host described by `TEST_HOST`, with the password from
/// `TEST_PASSWORD` if there is one.
pub async fn connect(runner: &SshRunner) -> Session {
    let addr = addr();
    let parsed = parse_user_host_port(&addr).unwrap();
    let password = std::env::var("TEST_PASSWORD").ok();
    runner
        .connect(
            parsed.user.unwrap_or("test-user"),
            parsed.host.unwrap_or("127.0.0.1"),
            parsed.port.and_then(|p| p.parse().ok()).unwrap_or(22),
            password.as_deref(),
        )
        .await
        .unwrap()
}

/// Ask the master of `session` to exit behind the session's back, as a dropped connection
/// would.
pub async fn stop_master(session: &Session) {
    let status = tokio::process::Command::new("ssh")
        .arg("-S")
        .arg(session.control_directory().join("master"))
        .arg("-O")
        .arg("exit")
        .arg(session.destination())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(status.success());
}
