use relaybox::{ServerMessage, SessionOutcome};

use super::{Client, fixture_source, isolate_config, leftover_workspaces, output_text};

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_python_session() {
    let mut client = Client::connect(isolate_config());
    client.start("python", &fixture_source("greet.py")).await;

    assert_eq!(client.until_prompt().await.1, "Name: ");
    client.input("Grace").await;
    assert_eq!(client.until_prompt().await.1, "Age: ");
    client.input("85").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "Hello Grace, next year you turn 86\n");
    assert!(matches!(
        status,
        ServerMessage::Status {
            status: SessionOutcome::Success,
            ..
        }
    ));

    let root = client.root().to_path_buf();
    client.finish().await;
    assert_eq!(leftover_workspaces(&root), 0);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_c_session() {
    let mut client = Client::connect(isolate_config());
    client.start("c", &fixture_source("sum.c")).await;
    client.input("40 2").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "42\n");
    assert!(matches!(
        status,
        ServerMessage::Status {
            status: SessionOutcome::Success,
            exit_code: Some(0),
            ..
        }
    ));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_wall_clock() {
    let mut config = isolate_config();
    config.default_limits.time_limit = Some(1.0);
    config.default_limits.wall_time_limit = Some(1.0);

    let mut client = Client::connect(config);
    client.start("python", &fixture_source("spin.py")).await;

    let (_, status) = client.until_status().await;
    assert!(matches!(
        status,
        ServerMessage::Status {
            status: SessionOutcome::Timeout,
            ..
        }
    ));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_stop() {
    let mut client = Client::connect(isolate_config());
    client.start("python", "input('wait ')").await;
    client.until_prompt().await;

    client.send(serde_json::json!({"action": "stop"})).await;
    let (_, status) = client.until_status().await;
    assert!(matches!(
        status,
        ServerMessage::Status {
            status: SessionOutcome::Stopped,
            ..
        }
    ));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_cpp_threads() {
    let mut client = Client::connect(isolate_config());
    client.start("cpp", &fixture_source("threads.cpp")).await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "worker says 42\n");
    assert!(matches!(
        status,
        ServerMessage::Status {
            status: SessionOutcome::Success,
            ..
        }
    ));
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_isolate_c_output_arrives_before_input() {
    let mut client = Client::connect(isolate_config());
    client.start("c", &fixture_source("ask_first.c")).await;

    assert_eq!(client.next().await, ServerMessage::output("Enter n:\n"));
    client.input("1").await;
    assert_eq!(client.next().await, ServerMessage::output("n: "));
    client.input("4").await;

    let (seen, _) = client.until_status().await;
    assert_eq!(output_text(&seen), "8\n");
}
