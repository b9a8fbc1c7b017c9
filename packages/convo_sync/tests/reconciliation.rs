//! End-to-end reconciliation scenarios driven by wire-format frames.

use convo_sync::{EventEffect, InboundEvent, Reconciler};

fn frame(json: &str) -> InboundEvent {
    InboundEvent::from_json(json).expect("valid frame")
}

fn chunk(id: &str, content: &str, ts: i64) -> InboundEvent {
    frame(&format!(
        r#"{{"type":"chunk","data":{{"message_id":"{id}","session_id":"s1","user_id":"demo_user","role":"assistant","content":"{content}","chunk":"x","timestamp":{ts},"is_complete":false}}}}"#
    ))
}

fn complete(id: &str, content: &str, ts: i64) -> InboundEvent {
    frame(&format!(
        r#"{{"type":"complete","data":{{"message_id":"{id}","session_id":"s1","user_id":"demo_user","role":"assistant","content":"{content}","timestamp":{ts}}}}}"#
    ))
}

fn user_echo(id: &str, content: &str, ts: i64) -> InboundEvent {
    frame(&format!(
        r#"{{"type":"message","data":{{"message_id":"{id}","session_id":"s1","user_id":"demo_user","role":"user","content":"{content}","timestamp":{ts},"is_complete":true}}}}"#
    ))
}

#[test]
fn full_exchange_produces_two_messages() {
    let mut convo = Reconciler::new();
    convo.optimistic_insert("temp_1", "hi", "s1", "demo_user");

    convo.apply_event(frame(r#"{"type":"welcome","sessionId":"s1"}"#));
    convo.apply_event(user_echo("srv_1", "hi", 100));
    convo.apply_event(chunk("a1", "Hel", 101));
    convo.apply_event(chunk("a1", "Hello", 102));
    convo.apply_event(complete("a1", "Hello world", 103));

    let messages = convo.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].message_id, "srv_1");
    assert_eq!(messages[1].message_id, "a1");
    assert_eq!(messages[1].content, "Hello world");
    assert!(messages[1].is_complete);
}

#[test]
fn reconnect_overlap_between_history_and_live_stream() {
    // Live stream delivered chunks 6 and 7; the history read after
    // resubscribing only saw up to chunk 6.
    let mut convo = Reconciler::new();
    convo.apply_event(user_echo("user_msg_001", "Test message", 1));
    convo.apply_event(chunk("test_message_001", "chunk1 chunk2 chunk3 chunk4 chunk5 chunk6", 6));
    convo.apply_event(chunk("test_message_001", "chunk1 chunk2 chunk3 chunk4 chunk5 chunk6 chunk7", 7));

    let history = frame(
        r#"{"type":"history","messages":[
            {"message_id":"user_msg_001","role":"user","content":"Test message","timestamp":1},
            {"message_id":"test_message_001","role":"assistant","content":"chunk1 chunk2 chunk3 chunk4 chunk5","timestamp":5,"is_complete":false},
            {"message_id":"test_message_001","role":"assistant","content":"chunk1 chunk2 chunk3 chunk4 chunk5 chunk6","timestamp":6,"is_complete":false}
        ]}"#,
    );
    assert_eq!(
        convo.apply_event(history),
        EventEffect::HistoryLoaded { added: 0 }
    );
    assert_eq!(convo.len(), 2);
    assert!(convo.messages()[1].content.ends_with("chunk7"));

    // Re-delivery of chunk 7 after the checkpoint is dropped.
    convo.apply_event(chunk("test_message_001", "chunk1 chunk2 chunk3 chunk4 chunk5 chunk6 chunk7", 7));
    convo.apply_event(complete("test_message_001", "chunk1 chunk2 chunk3 chunk4 chunk5 chunk6 chunk7 chunk8", 8));
    assert_eq!(convo.len(), 2);
    assert!(convo.messages()[1].is_complete);
    assert!(convo.messages()[1].content.ends_with("chunk8"));
}

#[test]
fn history_before_any_live_traffic() {
    let mut convo = Reconciler::new();
    convo.apply_event(frame(
        r#"{"type":"history","messages":[
            {"message_id":"u1","role":"user","content":"hi","timestamp":1,"is_complete":true},
            {"message_id":"a1","role":"assistant","content":"hello","timestamp":2,"is_complete":true}
        ]}"#,
    ));
    convo.optimistic_insert("temp_2", "again", "s1", "demo_user");
    convo.apply_event(user_echo("u2", "again", 3));
    convo.apply_event(chunk("a2", "sure", 4));

    let ids: Vec<&str> = convo.messages().iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "a1", "u2", "a2"]);
}

#[test]
fn cancelled_reply_stays_partial_and_complete() {
    let mut convo = Reconciler::new();
    convo.apply_event(chunk("a1", "Once upon", 1));
    convo.apply_event(frame(r#"{"type":"cancelled","message_id":"a1"}"#));

    let msg = convo.get("a1").unwrap();
    assert_eq!(msg.content, "Once upon");
    assert!(msg.is_complete);

    // Nothing that trails the cancel reopens it.
    convo.apply_event(chunk("a1", "Once upon a", 2));
    assert!(convo.get("a1").unwrap().is_complete);
    assert_eq!(convo.get("a1").unwrap().content, "Once upon");
}

#[test]
fn error_and_control_frames_leave_list_untouched() {
    let mut convo = Reconciler::new();
    convo.apply_event(chunk("a1", "x", 1));
    let version = convo.version();

    for json in [
        r#"{"type":"error","error":"AI service unavailable"}"#,
        r#"{"type":"pong"}"#,
        r#"{"type":"heartbeat_ack"}"#,
        r#"{"type":"recovery_status","status":"ok","chunksRecovered":0}"#,
        r#"{"type":"something_new","payload":1}"#,
    ] {
        assert_eq!(convo.apply_event(frame(json)), EventEffect::NoChange);
    }
    assert_eq!(convo.version(), version);
}

#[test]
fn independent_conversations_do_not_share_state() {
    let mut first = Reconciler::new();
    let mut second = Reconciler::new();

    first.optimistic_insert("temp_1", "hi", "s1", "demo_user");
    second.apply_event(user_echo("srv_1", "hi", 1));

    assert_eq!(first.messages()[0].message_id, "temp_1");
    assert_eq!(first.pending_count(), 1);
    assert_eq!(second.messages()[0].message_id, "srv_1");
    assert_eq!(second.pending_count(), 0);
}

#[test]
fn repeated_text_from_same_user_is_shown_again() {
    let mut convo = Reconciler::new();
    convo.apply_event(user_echo("srv_other", "ok", 1));
    convo.apply_event(complete("a1", "sure", 2));

    convo.optimistic_insert("temp_1", "ok", "s1", "demo_user");
    let ids: Vec<&str> = convo.messages().iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["srv_other", "a1", "temp_1"]);

    // The send never gets an echo; the entry stays visible.
    convo.apply_event(frame(r#"{"type":"error","error":"send failed"}"#));
    assert!(convo.get("temp_1").is_some_and(|m| m.is_complete));
}

#[test]
fn echo_that_beats_the_insert_is_merged_once() {
    let mut convo = Reconciler::new();
    convo.reserve("temp_1");
    convo.apply_event(user_echo("srv_1", "hi", 1));
    assert!(convo.is_empty());

    convo.optimistic_insert("temp_1", "hi", "s1", "demo_user");
    convo.apply_event(chunk("a1", "Hel", 2));

    let ids: Vec<&str> = convo.messages().iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids, vec!["srv_1", "a1"]);
    assert_eq!(convo.pending_count(), 0);
}
