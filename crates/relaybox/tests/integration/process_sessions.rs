use relaybox::{ServerMessage, SessionOutcome};

use super::{Client, fixture_source, leftover_workspaces, output_text, process_config};

fn status_fields(message: &ServerMessage) -> (SessionOutcome, Option<i32>, Option<&str>) {
    match message {
        ServerMessage::Status {
            status,
            exit_code,
            friendly_error,
            ..
        } => (*status, *exit_code, friendly_error.as_deref()),
        other => panic!("expected a status message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_python_prompts_and_input() {
    let mut client = Client::connect(process_config());
    client.start("python", &fixture_source("greet.py")).await;

    let (_, prompt) = client.until_prompt().await;
    assert_eq!(prompt, "Name: ");
    client.input("Ada").await;

    let (_, prompt) = client.until_prompt().await;
    assert_eq!(prompt, "Age: ");
    client.input("36").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "Hello Ada, next year you turn 37\n");
    assert_eq!(status_fields(&status), (SessionOutcome::Success, Some(0), None));

    let root = client.root().to_path_buf();
    assert_eq!(client.finish().await, Some(SessionOutcome::Success));
    assert_eq!(leftover_workspaces(&root), 0);
}

#[tokio::test]
async fn test_python_runtime_error_is_explained() {
    let mut client = Client::connect(process_config());
    client.start("python", &fixture_source("divide.py")).await;

    let (seen, status) = client.until_status().await;
    let text = output_text(&seen);
    assert!(text.contains("before\n"));
    assert!(text.contains("ZeroDivisionError"));

    let (outcome, exit_code, friendly) = status_fields(&status);
    assert_eq!(outcome, SessionOutcome::Error);
    assert_eq!(exit_code, Some(1));
    assert!(friendly.unwrap().starts_with("You're trying to divide by zero"));
}

#[tokio::test]
async fn test_python_timeout() {
    let mut config = process_config();
    config.default_limits.time_limit = Some(1.0);
    config.default_limits.wall_time_limit = Some(1.0);

    let mut client = Client::connect(config);
    client.start("python", &fixture_source("spin.py")).await;

    let (_, status) = client.until_status().await;
    let (outcome, _, friendly) = status_fields(&status);
    assert_eq!(outcome, SessionOutcome::Timeout);
    assert!(friendly.unwrap().contains("exceeded the 1 second limit"));
}

#[tokio::test]
async fn test_stop_while_waiting_for_input() {
    let mut client = Client::connect(process_config());
    client.start("python", "input('go? ')\nprint('never')").await;

    client.until_prompt().await;
    client.send(serde_json::json!({"action": "stop"})).await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "");
    assert_eq!(status_fields(&status).0, SessionOutcome::Stopped);
}

#[tokio::test]
async fn test_disconnect_cleans_up() {
    let mut client = Client::connect(process_config());
    client.start("python", "input('waiting ')").await;
    client.until_prompt().await;

    client.disconnect();
    let root = client.root().to_path_buf();
    assert_eq!(client.finish().await, None);
    assert_eq!(leftover_workspaces(&root), 0);
}

#[tokio::test]
async fn test_c_reads_stdin() {
    let mut client = Client::connect(process_config());
    client.start("c", &fixture_source("sum.c")).await;
    client.input("19 23").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "42\n");
    assert_eq!(status_fields(&status).0, SessionOutcome::Success);
}

#[tokio::test]
async fn test_cpp_echo_with_alias() {
    let mut client = Client::connect(process_config());
    client.start("C++", &fixture_source("echo.cpp")).await;

    client.input("one").await;
    assert_eq!(client.next().await, ServerMessage::output("echo: one\n"));
    client.input("two").await;
    assert_eq!(client.next().await, ServerMessage::output("echo: two\n"));

    client.send(serde_json::json!({"action": "stop"})).await;
    let (_, status) = client.until_status().await;
    assert_eq!(status_fields(&status).0, SessionOutcome::Stopped);
}

#[tokio::test]
async fn test_cpp_compile_error() {
    let mut client = Client::connect(process_config());
    client.start("cpp", &fixture_source("broken.cpp")).await;

    match client.next().await {
        ServerMessage::Error {
            error,
            friendly_error,
        } => {
            assert!(error.contains("cout"));
            assert!(friendly_error.unwrap().contains("cout"));
        }
        other => panic!("expected a compile error, got {other:?}"),
    }

    let (seen, status) = client.until_status().await;
    assert!(seen.is_empty());
    assert_eq!(status_fields(&status).0, SessionOutcome::Error);

    let root = client.root().to_path_buf();
    client.finish().await;
    assert_eq!(leftover_workspaces(&root), 0);
}

#[tokio::test]
async fn test_javascript_prompt() {
    let mut client = Client::connect(process_config());
    client.start("javascript", &fixture_source("ask.js")).await;

    let (_, prompt) = client.until_prompt().await;
    assert_eq!(prompt, "Number: ");
    client.input("21").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "double: 42\n");
    assert_eq!(status_fields(&status).0, SessionOutcome::Success);
}

#[tokio::test]
async fn test_unsupported_language() {
    let mut client = Client::connect(process_config());
    client.start("ruby", "puts 1").await;

    assert_eq!(
        client.next().await,
        ServerMessage::error("Unsupported language.")
    );
    let (_, status) = client.until_status().await;
    assert_eq!(status_fields(&status).0, SessionOutcome::Error);

    let root = client.root().to_path_buf();
    client.finish().await;
    assert_eq!(leftover_workspaces(&root), 0);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let mut first = Client::connect(process_config());
    let mut second = Client::connect(process_config());
    first.start("python", "print(input('a? '))").await;
    second.start("python", "print(input('b? '))").await;

    assert_eq!(first.until_prompt().await.1, "a? ");
    assert_eq!(second.until_prompt().await.1, "b? ");

    second.input("two").await;
    first.input("one").await;

    let (seen, _) = first.until_status().await;
    assert_eq!(output_text(&seen), "one\n");
    let (seen, _) = second.until_status().await;
    assert_eq!(output_text(&seen), "two\n");
}

#[tokio::test]
async fn test_python_prompt_after_partial_output() {
    let mut client = Client::connect(process_config());
    client.start("python", &fixture_source("partial.py")).await;

    let (seen, prompt) = client.until_prompt().await;
    assert_eq!(output_text(&seen), "Enter:");
    assert_eq!(prompt, "n:");
    client.input("5").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "got 5\n");
    assert_eq!(status_fields(&status).0, SessionOutcome::Success);
}

#[tokio::test]
async fn test_javascript_prompt_after_partial_output() {
    let mut client = Client::connect(process_config());
    client.start("javascript", &fixture_source("partial.js")).await;

    let (seen, prompt) = client.until_prompt().await;
    assert_eq!(output_text(&seen), "Enter:");
    assert_eq!(prompt, "n:");
    client.input("7").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "got 7\n");
    assert_eq!(status_fields(&status).0, SessionOutcome::Success);
}

#[tokio::test]
async fn test_c_output_arrives_before_input() {
    let mut client = Client::connect(process_config());
    client.start("c", &fixture_source("ask_first.c")).await;

    // Each line arrives before any input is sent
    assert_eq!(client.next().await, ServerMessage::output("Enter n:\n"));
    client.input("1").await;
    assert_eq!(client.next().await, ServerMessage::output("n: "));
    client.input("21").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "42\n");
    assert_eq!(status_fields(&status).0, SessionOutcome::Success);
}

#[tokio::test]
async fn test_cpp_prompt_without_newline_arrives() {
    let mut client = Client::connect(process_config());
    client.start("cpp", &fixture_source("ask_first.cpp")).await;

    assert_eq!(client.next().await, ServerMessage::output("Name? "));
    client.input("Lin").await;

    let (seen, status) = client.until_status().await;
    assert_eq!(output_text(&seen), "hi Lin\n");
    assert_eq!(status_fields(&status).0, SessionOutcome::Success);
}
