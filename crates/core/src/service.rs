//! Database service control through `systemctl`.
//!
//! `stop`/`start` are idempotent at the service-manager level and are
//! followed by a fixed settle delay: `systemctl` returning does not
//! guarantee the listening socket is already closed or open.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::process::{CommandRunner, Invocation, ProcessError};

/// Default timeout for a single `systemctl` call.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default wait after a start/stop before the service is assumed settled.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// `systemctl is-active` exit codes that still carry a usable answer:
/// running (0) or the LSB "not running" family (1-3).
const RECOGNIZED_STATUS_CODES: &[i32] = &[0, 1, 2, 3];

/// Allowed service name characters: alphanumeric, hyphen, underscore, dot, `@`.
pub fn is_safe_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

/// Service state as reported by `systemctl is-active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Active,
    Inactive,
    Activating,
    Deactivating,
    Failed,
    Unknown,
}

impl ServiceState {
    fn parse(reply: &str) -> Self {
        match reply.trim() {
            "active" | "reloading" | "refreshing" => Self::Active,
            "inactive" => Self::Inactive,
            "activating" => Self::Activating,
            "deactivating" => Self::Deactivating,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Deactivating => "deactivating",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
}

impl ServiceAction {
    fn verb(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid service name: {0:?}")]
    InvalidName(String),

    #[error("service '{service}' {action} failed (exit {exit_code}): {}", .stderr.trim())]
    Transition {
        service: String,
        action: ServiceAction,
        exit_code: i32,
        stderr: String,
    },

    #[error("service '{service}' status query failed (exit {exit_code}): {}", .stderr.trim())]
    UnknownUnit {
        service: String,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Starts, stops and queries one systemd unit.
pub struct ServiceController<R> {
    runner: Arc<R>,
    service: String,
    systemctl: String,
    timeout: Duration,
    settle_delay: Duration,
}

impl<R: CommandRunner> ServiceController<R> {
    pub fn new(runner: Arc<R>, service: impl Into<String>) -> Result<Self, ServiceError> {
        let service = service.into();
        if !is_safe_service_name(&service) {
            return Err(ServiceError::InvalidName(service));
        }
        Ok(Self {
            runner,
            service,
            systemctl: "systemctl".to_string(),
            timeout: DEFAULT_SERVICE_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Query the unit state. Transitional replies are returned as-is rather
    /// than treated as errors.
    pub async fn state(&self) -> Result<ServiceState, ServiceError> {
        let inv = Invocation::new(&self.systemctl, self.timeout)
            .args(["is-active", self.service.as_str()])
            .as_user("root")
            .best_effort();
        let output = self.runner.run(&inv).await?;
        let state = ServiceState::parse(&output.stdout);

        if !RECOGNIZED_STATUS_CODES.contains(&output.exit_code) && state == ServiceState::Unknown {
            return Err(ServiceError::UnknownUnit {
                service: self.service.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        tracing::debug!(service = %self.service, state = %state, exit_code = output.exit_code, "Service status");
        Ok(state)
    }

    /// `true` only when the unit reports `active`.
    pub async fn status(&self) -> Result<bool, ServiceError> {
        Ok(self.state().await?.is_active())
    }

    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.transition(ServiceAction::Stop).await
    }

    pub async fn start(&self) -> Result<(), ServiceError> {
        self.transition(ServiceAction::Start).await
    }

    async fn transition(&self, action: ServiceAction) -> Result<(), ServiceError> {
        tracing::info!(service = %self.service, action = %action, "Service transition");

        let inv = Invocation::new(&self.systemctl, self.timeout)
            .args([action.verb(), self.service.as_str()])
            .as_user("root")
            .best_effort();
        let output = self.runner.run(&inv).await?;

        tokio::time::sleep(self.settle_delay).await;

        if !output.success() {
            tracing::error!(
                service = %self.service,
                action = %action,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Service transition failed",
            );
            return Err(ServiceError::Transition {
                service: self.service.clone(),
                action,
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::process::CommandOutput;

    /// Minimal in-memory systemd: tracks one unit's active flag.
    #[derive(Default)]
    struct FakeSystemd {
        active: Mutex<bool>,
        fail_start: bool,
        status_reply: Option<(i32, &'static str)>,
        calls: Mutex<Vec<String>>,
    }

    impl CommandRunner for FakeSystemd {
        async fn run(&self, inv: &Invocation) -> Result<CommandOutput, ProcessError> {
            self.calls.lock().unwrap().push(inv.command_line());
            let mut active = self.active.lock().unwrap();
            let (exit_code, stdout) = match inv.args[0].as_str() {
                "is-active" => match self.status_reply {
                    Some((code, reply)) => (code, reply.to_string()),
                    None if *active => (0, "active\n".to_string()),
                    None => (3, "inactive\n".to_string()),
                },
                "stop" => {
                    *active = false;
                    (0, String::new())
                }
                "start" if self.fail_start => (1, String::new()),
                "start" => {
                    *active = true;
                    (0, String::new())
                }
                other => panic!("unexpected systemctl verb {other}"),
            };
            Ok(CommandOutput {
                exit_code,
                stdout,
                stderr: if exit_code == 0 { String::new() } else { "boom".into() },
                duration_ms: 0,
            })
        }
    }

    fn controller(fake: FakeSystemd) -> ServiceController<FakeSystemd> {
        ServiceController::new(Arc::new(fake), "mysql")
            .expect("valid name")
            .with_settle_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn stop_twice_is_idempotent() {
        let ctl = controller(FakeSystemd {
            active: Mutex::new(true),
            ..Default::default()
        });
        ctl.stop().await.expect("first stop");
        ctl.stop().await.expect("second stop");
        assert_eq!(ctl.state().await.expect("state"), ServiceState::Inactive);
        assert!(!ctl.status().await.expect("status"));
    }

    #[tokio::test]
    async fn start_then_status_active() {
        let ctl = controller(FakeSystemd::default());
        ctl.start().await.expect("start");
        ctl.start().await.expect("start again");
        assert!(ctl.status().await.expect("status"));
    }

    #[tokio::test]
    async fn failed_start_is_transition_error() {
        let ctl = controller(FakeSystemd {
            fail_start: true,
            ..Default::default()
        });
        assert_matches!(
            ctl.start().await,
            Err(ServiceError::Transition { action: ServiceAction::Start, exit_code: 1, .. })
        );
    }

    #[tokio::test]
    async fn transitional_reply_is_not_fatal() {
        let ctl = controller(FakeSystemd {
            status_reply: Some((3, "deactivating\n")),
            ..Default::default()
        });
        assert_eq!(ctl.state().await.expect("state"), ServiceState::Deactivating);
        assert!(!ctl.status().await.expect("status"));

        let ctl = controller(FakeSystemd {
            status_reply: Some((0, "activating\n")),
            ..Default::default()
        });
        assert_eq!(ctl.state().await.expect("state"), ServiceState::Activating);
    }

    #[tokio::test]
    async fn unknown_unit_is_error() {
        let ctl = controller(FakeSystemd {
            status_reply: Some((4, "")),
            ..Default::default()
        });
        assert_matches!(ctl.state().await, Err(ServiceError::UnknownUnit { exit_code: 4, .. }));
    }

    #[tokio::test]
    async fn commands_target_configured_unit() {
        let fake = Arc::new(FakeSystemd::default());
        let ctl = ServiceController::new(fake.clone(), "mariadb")
            .expect("valid")
            .with_settle_delay(Duration::ZERO);
        ctl.stop().await.expect("stop");
        ctl.status().await.expect("status");
        assert_eq!(
            *fake.calls.lock().unwrap(),
            ["systemctl stop mariadb", "systemctl is-active mariadb"]
        );
    }

    #[test]
    fn unsafe_service_names_rejected() {
        assert!(is_safe_service_name("mysql"));
        assert!(is_safe_service_name("mariadb@main.service"));
        assert!(!is_safe_service_name(""));
        assert!(!is_safe_service_name("mysql; rm -rf /"));
        assert!(!is_safe_service_name(&"a".repeat(200)));
    }
}
