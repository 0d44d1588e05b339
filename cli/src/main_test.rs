use super::*;
use clap::CommandFactory;

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn parse_header_splits_on_first_colon() {
    let (name, value) = parse_header("X-Trace: a:b:c").expect("header");
    assert_eq!(name.as_str(), "x-trace");
    assert_eq!(value.to_str().expect("ascii"), "a:b:c");
}

#[test]
fn parse_header_rejects_missing_colon_and_bad_names() {
    assert!(matches!(parse_header("no-colon"), Err(CliError::InvalidHeader(raw)) if raw == "no-colon"));
    assert!(matches!(parse_header("bad name: x"), Err(CliError::InvalidHeader(_))));
}

#[test]
fn build_request_attaches_body_and_headers() {
    let args = RawRequestArgs {
        endpoint: "/api/tasks/".to_owned(),
        data: Some(r#"{"title": "Buy milk"}"#.to_owned()),
        headers: vec!["Content-Type: text/plain".to_owned(), "X-Req: 7".to_owned()],
    };
    let request = build_request(Method::POST, args).expect("request");
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.body, Some(serde_json::json!({"title": "Buy milk"})));
    assert_eq!(request.headers["content-type"], "text/plain");
    assert_eq!(request.headers["x-req"], "7");
}

#[test]
fn build_request_rejects_invalid_json() {
    let args = RawRequestArgs { endpoint: "/x".to_owned(), data: Some("{oops".to_owned()), headers: Vec::new() };
    assert!(matches!(build_request(Method::PUT, args), Err(CliError::InvalidJson(_))));
}

#[test]
fn chat_request_prefers_learned_conversation_id() {
    let opts = ChatOpts { model_size: Some(ModelSize::Large), conversation_id: Some("flag".to_owned()), timeout_secs: 5 };

    let first = build_chat_request("hi".to_owned(), &opts, None);
    assert_eq!(first.conversation_id.as_deref(), Some("flag"));
    assert_eq!(first.model_size, Some(ModelSize::Large));

    let later = build_chat_request("again".to_owned(), &opts, Some("learned"));
    assert_eq!(later.conversation_id.as_deref(), Some("learned"));
}

#[test]
fn chat_send_parses_model_size_flag() {
    let cli = Cli::try_parse_from(["assistant-cli", "chat", "send", "hello", "--model-size", "small"]).expect("parse");
    let Command::Chat(ChatCommand { command: ChatSubcommand::Send { message, opts } }) = cli.command else {
        panic!("expected chat send");
    };
    assert_eq!(message, "hello");
    assert_eq!(opts.model_size, Some(ModelSize::Small));
    assert_eq!(opts.timeout_secs, 60);

    assert!(Cli::try_parse_from(["assistant-cli", "chat", "send", "hello", "--model-size", "huge"]).is_err());
}
