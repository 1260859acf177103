use std::sync::Arc;
use std::time::Duration;

use less_bridge::dispatch::{FrameStack, Variable};
use less_bridge::mux::MuxError;
use less_bridge::{CallArg, CallMode, Config, DispatchError, Error, HostError, Runtime};
use less_flat::Node;
use rstest::rstest;
use serde_json::{Value, json};

fn config(mode: CallMode) -> Config {
    Config {
        mode,
        peer_command: env!("CARGO_BIN_EXE_echo-peer").to_string(),
        call_timeout: Duration::from_secs(10),
        protocol_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(2),
        ..Config::default()
    }
}

fn start(config: Config) -> Runtime {
    let runtime = Runtime::start(config).unwrap();
    runtime
        .load_plugin("plugins/echo.js", Value::Null, runtime.root_scope())
        .unwrap();
    runtime
}

fn call(runtime: &Runtime, name: &str, args: &[CallArg]) -> Result<String, DispatchError> {
    let function = runtime.root_scope().lookup_function(name).unwrap();
    function.call(args).map(|result| result.to_css())
}

fn px_args() -> Vec<CallArg> {
    vec![CallArg::from(Node::dimension(1.0, "px")), CallArg::from(2.0)]
}

#[rstest]
#[case::json(CallMode::Json)]
#[case::binary(CallMode::Binary)]
fn test_add(#[case] mode: CallMode) {
    let runtime = start(config(mode));
    assert_eq!(call(&runtime, "add", &px_args()).unwrap(), "3px");

    let stats = runtime.stats();
    match mode {
        CallMode::Json => assert_eq!(stats.json_calls, 1),
        CallMode::Binary => assert_eq!(stats.protocol_calls, 1),
    }
}

#[rstest]
#[case::dimension(Node::dimension(12.5, "rem"), "12.5rem")]
#[case::color(Node::color([255.0, 0.0, 0.0], 1.0), "#ff0000")]
#[case::translucent(Node::color([0.0, 0.0, 255.0], 0.25), "rgba(0, 0, 255, 0.25)")]
#[case::quoted(Node::quoted('"', "a b", false), "\"a b\"")]
#[case::expression(Node::expression(vec![Node::dimension(1.0, "px"), Node::keyword("solid")]), "1px solid")]
#[case::declaration(Node::declaration("margin", Node::dimension(0.0, "")), "margin: 0")]
#[case::ruleset(
    Node::ruleset(vec![Node::keyword(".a")], vec![Node::declaration("color", Node::keyword("red"))]),
    ".a { color: red; }"
)]
fn test_echo_round_trips_values(#[case] node: Node, #[case] css: &str) {
    for mode in [CallMode::Json, CallMode::Binary] {
        let runtime = start(config(mode));
        assert_eq!(call(&runtime, "echo", &[CallArg::from(node.clone())]).unwrap(), css, "{mode}");
    }
}

#[test]
fn test_function_mode_override() {
    let runtime = start(config(CallMode::Binary));
    assert_eq!(call(&runtime, "jsonadd", &px_args()).unwrap(), "3px");
    let stats = runtime.stats();
    assert_eq!((stats.json_calls, stats.protocol_calls, stats.shm_calls), (1, 0, 0));
}

#[test]
fn test_binary_mode_uses_regions_for_structured_arguments() {
    let runtime = start(config(CallMode::Binary));
    let args = [CallArg::Json(json!({"_type": "Call", "name": "f", "args": []}))];
    assert_eq!(call(&runtime, "echo", &args).unwrap(), "f()");
    assert_eq!(runtime.stats().shm_calls, 1);
}

#[rstest]
#[case::json(CallMode::Json)]
#[case::binary(CallMode::Binary)]
fn test_peer_error(#[case] mode: CallMode) {
    let runtime = start(config(mode));
    let err = call(&runtime, "fail", &[]).unwrap_err();
    assert!(matches!(err, DispatchError::Peer(message) if message == "fail was called"));
    assert_eq!(call(&runtime, "add", &px_args()).unwrap(), "3px");
}

#[rstest]
#[case::json(CallMode::Json)]
#[case::binary(CallMode::Binary)]
fn test_cache_is_cleared_per_compilation(#[case] mode: CallMode) {
    let runtime = start(config(mode));
    assert_eq!(call(&runtime, "calls", &[]).unwrap(), "1");
    assert_eq!(call(&runtime, "calls", &[]).unwrap(), "1");
    runtime.begin_compilation();
    assert_eq!(call(&runtime, "calls", &[]).unwrap(), "2");
    assert_eq!(runtime.stats().cache_hits, 1);
}

#[test]
fn test_cache_disabled() {
    let runtime = start(Config {
        cache_results: false,
        ..config(CallMode::Json)
    });
    assert_eq!(call(&runtime, "calls", &[]).unwrap(), "1");
    assert_eq!(call(&runtime, "calls", &[]).unwrap(), "2");
}

#[test]
fn test_shadowed_function_results_stay_in_their_scope() {
    let runtime = start(config(CallMode::Json));
    let child = runtime.root_scope().create_child();
    runtime.load_plugin("plugins/local.js", Value::Null, &child).unwrap();

    let outer = runtime.root_scope().lookup_function("calls").unwrap();
    let inner = child.lookup_function("calls").unwrap();
    assert_eq!(inner.origin, child.key());
    assert_ne!(inner.origin, outer.origin);

    assert_eq!(outer.call(&[]).unwrap().to_css(), "1");
    assert_eq!(inner.call(&[]).unwrap().to_css(), "2");
    assert_eq!(outer.call(&[]).unwrap().to_css(), "1");
}

#[rstest]
#[case::json_preloaded(CallMode::Json, "@primary", "context")]
#[case::json_other(CallMode::Json, "@gutter", "callback")]
#[case::binary_preloaded(CallMode::Binary, "@primary", "preload")]
#[case::binary_other(CallMode::Binary, "@gutter", "callback")]
fn test_context_variables(#[case] mode: CallMode, #[case] name: &str, #[case] source: &str) {
    let runtime = start(config(mode));
    let mut frames = FrameStack::new();
    frames
        .push_frame(1)
        .define(Variable::new("@primary", Node::color([0.0, 128.0, 0.0], 1.0)))
        .push_frame(2)
        .define(Variable::new("@gutter", Node::dimension(16.0, "px")));
    let frames = Arc::new(frames);
    let scope = runtime.root_scope();

    let lookup = |function: &str| {
        scope
            .lookup_function(function)
            .unwrap()
            .call_with_context(&[CallArg::from(name)], frames.clone())
            .unwrap()
            .to_css()
    };
    assert_eq!(lookup("varsource"), source);
    let expected = if name == "@primary" { "#008000" } else { "16px" };
    assert_eq!(lookup("var"), expected);
}

#[test]
fn test_missing_variable_is_null() {
    let runtime = start(config(CallMode::Binary));
    let var = runtime.root_scope().lookup_function("var").unwrap();
    let result = var
        .call_with_context(&[CallArg::from("@nope")], Arc::new(FrameStack::new()))
        .unwrap();
    assert!(result.is_null());
}

#[test]
fn test_region_failure_falls_back_to_json() {
    let runtime = start(Config {
        shm_capacity: Some(0),
        ..config(CallMode::Binary)
    });
    assert!(!runtime.dispatcher().has_protocol());
    assert_eq!(call(&runtime, "add", &px_args()).unwrap(), "3px");
    let stats = runtime.stats();
    assert_eq!((stats.json_calls, stats.fallbacks), (1, 1));
}

#[test]
fn test_plugin_registrations_accumulate() {
    let runtime = start(config(CallMode::Json));
    let child = runtime.root_scope().create_child();
    let manifest = runtime
        .load_plugin("plugins/nested.js", json!({"priority": 0}), &child)
        .unwrap();
    assert_eq!(manifest.functions.len(), 7);

    let names = |items: Vec<String>| items.join(",");
    assert_eq!(
        names(child.get_pre_processors().into_iter().map(|p| p.name).collect()),
        "nested.js-pre,echo.js-pre"
    );
    assert_eq!(
        names(child.get_visitors().into_iter().map(|v| v.name).collect()),
        "echo.js-visitor,nested.js-visitor"
    );
    assert_eq!(
        names(child.get_file_managers().into_iter().map(|m| m.name).collect()),
        "nested.js-files,echo.js-files"
    );
    assert_eq!(runtime.root_scope().get_visitors().len(), 1);
}

#[test]
fn test_missing_plugin() {
    let runtime = Runtime::start(config(CallMode::Json)).unwrap();
    let err = runtime
        .load_plugin("plugins/missing.js", Value::Null, runtime.root_scope())
        .unwrap_err();
    assert!(matches!(err, Error::Host(HostError::Mux(MuxError::Remote(message))) if message.contains("missing.js")));
}

#[test]
fn test_shutdown() {
    let runtime = start(config(CallMode::Binary));
    assert!(runtime.host().is_running());
    assert!(runtime.dispatcher().has_protocol());

    runtime.shutdown();
    assert!(!runtime.host().is_running());
    assert!(!runtime.dispatcher().has_protocol());
    assert!(matches!(
        call(&runtime, "add", &[CallArg::from(Node::declaration("a", Node::null()))]),
        Err(DispatchError::Mux(MuxError::Disconnected))
    ));
    runtime.shutdown();
}

#[test]
fn test_spawn_failure() {
    let err = Runtime::start(Config {
        peer_command: "/nonexistent/echo-peer".to_string(),
        ..config(CallMode::Json)
    })
    .unwrap_err();
    assert!(matches!(err, Error::Host(HostError::Spawn { .. })));
}
