//! Embedded-mode servers driven through the manager.
#![cfg(unix)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use mcga_core::config::{ControlSettings, GlobalConfig, ServerConfig};
use mcga_core::container::wait_for_state;
use mcga_core::error::ControlError;
use mcga_core::event::EventHub;
use mcga_core::manager::ServerManager;
use mcga_core::protocol::ProcessState;

fn manager_with(servers: Vec<ServerConfig>, state_timeout: Duration) -> ServerManager {
    let config = GlobalConfig {
        control: ControlSettings {
            state_timeout,
            state_poll_interval: Duration::from_millis(20),
            ..ControlSettings::default()
        },
        servers,
    };
    ServerManager::new(config, Arc::new(EventHub::new())).unwrap()
}

#[tokio::test]
async fn test_start_stop_and_restart() {
    let script = "while read line; do [ \"$line\" = stop ] && exit 0; done";
    let manager = manager_with(
        vec![ServerConfig::new("local", ".", &["sh", "-c", script])],
        Duration::from_secs(5),
    );

    manager.start_server("local").await.unwrap();
    assert!(manager.is_server_running("local").await.unwrap());
    assert!(matches!(
        manager.start_server("local").await.unwrap_err(),
        ControlError::AlreadyRunning(_)
    ));

    manager.send_command("local", "list").await.unwrap();
    manager.stop_server("local").await.unwrap();
    assert!(!manager.is_server_running("local").await.unwrap());
    assert!(matches!(
        manager.send_command("local", "list").await.unwrap_err(),
        ControlError::NotRunning(_)
    ));

    // a fresh process may start after the previous one exited
    manager.start_server("local").await.unwrap();
    manager.stop_server("local").await.unwrap();
}

#[tokio::test]
async fn test_slow_stop_times_out_then_converges() {
    let script = "read line; sleep 1";
    let manager = manager_with(
        vec![ServerConfig::new("slow", ".", &["sh", "-c", script])],
        Duration::from_millis(200),
    );

    manager.start_server("slow").await.unwrap();
    let err = manager.stop_server("slow").await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::StateTimeout {
            desired: ProcessState::Idle,
            ..
        }
    ));
    // the timeout did not pretend the server stopped
    assert!(manager.is_server_running("slow").await.unwrap());

    let container = manager.container("slow").await.unwrap();
    let patient = ControlSettings {
        state_timeout: Duration::from_secs(5),
        state_poll_interval: Duration::from_millis(20),
        ..ControlSettings::default()
    };
    wait_for_state(container.as_ref(), ProcessState::Idle, &patient)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_manager_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[control]
state_timeout_secs = 3
state_poll_interval_ms = 50

[[servers]]
name = "survival"
working_dir = "."
command = "sh -c read"

[[servers]]
name = "creative"
working_dir = "."
command = ["true"]
enabled = false
"#
    )
    .unwrap();

    let config = GlobalConfig::load(file.path()).unwrap();
    assert_eq!(config.control.state_timeout, Duration::from_secs(3));
    let manager = ServerManager::new(config, Arc::new(EventHub::new())).unwrap();

    let rows = manager.list_servers().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "survival");
    assert!(!rows[0].running);
    assert!(matches!(
        manager.stop_server("creative").await.unwrap_err(),
        ControlError::ServerNotFound(_)
    ));
}
