//! Completion contract of the NDJSON streaming protocol, driven through
//! `run_stream` with scripted byte chunks instead of a live HTTP body.

use embedchat::error::WidgetError;
use embedchat::protocol::{FinalResponse, MetaEvent};
use embedchat::stream::{StreamObserver, run_stream};
use futures::stream;

#[derive(Default)]
struct Recorder {
    metas: Vec<MetaEvent>,
    deltas: Vec<(String, String)>,
    controls: Vec<(bool, Option<String>)>,
    citations: Vec<Vec<String>>,
    finals: Vec<FinalResponse>,
    errors: Vec<String>,
    parse_errors: usize,
}

impl StreamObserver for Recorder {
    fn on_meta(&mut self, meta: &MetaEvent) {
        self.metas.push(meta.clone());
    }

    fn on_delta(&mut self, delta: &str, accumulated: &str) {
        self.deltas.push((delta.to_string(), accumulated.to_string()));
    }

    fn on_control(&mut self, escalate: bool, reason: Option<&str>) {
        self.controls.push((escalate, reason.map(str::to_string)));
    }

    fn on_citations(&mut self, citations: &[String]) {
        self.citations.push(citations.to_vec());
    }

    fn on_final(&mut self, response: &FinalResponse) {
        self.finals.push(response.clone());
    }

    fn on_error(&mut self, code: &str, _message: Option<&str>) {
        self.errors.push(code.to_string());
    }

    fn on_parse_error(&mut self, _line: &str, _reason: &str) {
        self.parse_errors += 1;
    }
}

fn chunks(parts: &[&str]) -> impl futures::Stream<Item = Result<Vec<u8>, WidgetError>> + Unpin {
    let items: Vec<Result<Vec<u8>, WidgetError>> = parts
        .iter()
        .map(|p| Ok(p.as_bytes().to_vec()))
        .collect();
    stream::iter(items)
}

#[tokio::test]
async fn meta_deltas_and_final_resolve_in_order() {
    let body = chunks(&[
        "{\"type\":\"meta\",\"conversation_id\":\"c1\",\"visitor_id\":\"v1\"}\n",
        "{\"type\":\"delta\",\"delta\":\"Our \"}\n{\"type\":\"delta\",\"delta\":\"refund \"}\n",
        "{\"type\":\"delta\",\"delta\":\"policy...\"}\n",
        "{\"type\":\"final\",\"response\":{\"success\":true,\"response\":\"Our refund policy...\",\"conversation_id\":\"c1\",\"responseId\":\"r1\"}}\n",
    ]);

    let mut recorder = Recorder::default();
    let response = run_stream(body, &mut recorder).await.unwrap();

    assert_eq!(response.response, "Our refund policy...");
    assert_eq!(response.conversation_id.as_deref(), Some("c1"));
    assert_eq!(response.feedback_id(), Some("r1"));

    assert_eq!(recorder.metas.len(), 1);
    assert_eq!(recorder.metas[0].visitor_id.as_deref(), Some("v1"));
    assert_eq!(
        recorder.deltas,
        vec![
            ("Our ".to_string(), "Our ".to_string()),
            ("refund ".to_string(), "Our refund ".to_string()),
            ("policy...".to_string(), "Our refund policy...".to_string()),
        ]
    );
    assert_eq!(recorder.finals.len(), 1);
}

#[tokio::test]
async fn stream_without_final_is_rejected() {
    let body = chunks(&[
        "{\"type\":\"delta\",\"delta\":\"partial answer\"}\n",
    ]);
    let err = run_stream(body, &mut Recorder::default()).await.unwrap_err();
    assert!(matches!(err, WidgetError::StreamEndedWithoutFinal));
}

#[tokio::test]
async fn server_error_event_explains_the_missing_final() {
    let body = chunks(&[
        "{\"type\":\"delta\",\"delta\":\"hm\"}\n",
        "{\"type\":\"error\",\"error\":\"model_overloaded\",\"message\":\"try again\"}\n",
    ]);
    let mut recorder = Recorder::default();
    let err = run_stream(body, &mut recorder).await.unwrap_err();
    match err {
        WidgetError::Backend { code, message } => {
            assert_eq!(code, "model_overloaded");
            assert_eq!(message, "try again");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
    assert_eq!(recorder.errors, vec!["model_overloaded".to_string()]);
}

#[tokio::test]
async fn invalid_conversation_error_event_maps_to_reset_variant() {
    let body = chunks(&[
        "{\"type\":\"error\",\"error\":\"invalid_conversation_id\"}\n",
    ]);
    let err = run_stream(body, &mut Recorder::default()).await.unwrap_err();
    assert!(matches!(err, WidgetError::InvalidConversation));
    assert!(err.requires_reset());
}

#[tokio::test]
async fn unsuccessful_final_is_an_error() {
    let body = chunks(&[
        "{\"type\":\"final\",\"response\":{\"success\":false,\"response\":\"\"}}\n",
    ]);
    let err = run_stream(body, &mut Recorder::default()).await.unwrap_err();
    assert!(matches!(err, WidgetError::UnsuccessfulResponse));
}

#[tokio::test]
async fn malformed_lines_are_skipped_without_aborting() {
    let body = chunks(&[
        "{\"type\":\"delta\",\"delta\":\"be\"}\n",
        "garbage that is not json\n",
        "{\"type\":\"delta\",\"delta\":\"fore\"}\n",
        "{\"type\":\"final\",\"response\":{\"success\":true,\"response\":\"before\"}}\n",
    ]);
    let mut recorder = Recorder::default();
    let response = run_stream(body, &mut recorder).await.unwrap();
    assert_eq!(response.response, "before");
    assert_eq!(recorder.parse_errors, 1);
    assert_eq!(recorder.deltas.len(), 2);
}

#[tokio::test]
async fn control_escalation_hint_is_surfaced_before_the_final() {
    let body = chunks(&[
        "{\"type\":\"control\",\"escalate\":true,\"reason\":\"user asked for a human\"}\n",
        "{\"type\":\"final\",\"response\":{\"success\":true,\"response\":\"Connecting you now.\",\"escalation\":{\"id\":\"e1\",\"status\":\"REQUESTED\"}}}\n",
    ]);
    let mut recorder = Recorder::default();
    let response = run_stream(body, &mut recorder).await.unwrap();
    assert_eq!(
        recorder.controls,
        vec![(true, Some("user asked for a human".to_string()))]
    );
    assert!(response.escalation.is_some());
}

#[tokio::test]
async fn legacy_untagged_final_is_honored() {
    let body = chunks(&[
        "{\"success\":true,\"response\":\"full answer\",\"conversation_id\":\"c3\"}\n",
    ]);
    let response = run_stream(body, &mut Recorder::default()).await.unwrap();
    assert_eq!(response.response, "full answer");
    assert_eq!(response.conversation_id.as_deref(), Some("c3"));
}

#[tokio::test]
async fn final_without_trailing_newline_is_flushed() {
    let body = chunks(&[
        "{\"type\":\"delta\",\"delta\":\"hi\"}\n",
        "{\"type\":\"final\",\"response\":{\"success\":true,\"response\":\"hi\"}}",
    ]);
    let response = run_stream(body, &mut Recorder::default()).await.unwrap();
    assert_eq!(response.response, "hi");
}
