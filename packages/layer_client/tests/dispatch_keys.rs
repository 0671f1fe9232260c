use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use layer_client::frame::{Change, ChangeObject};
use layer_client::{Frame, HandlerRegistry, Payload, Request, Response, change_key, methods};

fn arb_method() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(methods::COUNTER_READ.to_string()),
        Just(methods::CONVERSATION_CREATE.to_string()),
        Just(methods::MESSAGE_CREATE.to_string()),
        Just(methods::PRESENCE_UPDATE.to_string()),
        Just(methods::PRESENCE_SYNC.to_string()),
        "[A-Za-z]{1,12}\\.[A-Za-z_]{1,16}",
    ]
}

fn arb_object_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Conversation".to_string()),
        Just("Message".to_string()),
        "[A-Za-z]{1,12}",
    ]
}

fn arb_operation() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("create".to_string()),
        Just("mark_all_read".to_string()),
        Just("recipient_status".to_string()),
        "[A-Za-z_]{1,16}",
    ]
}

/// Randomly flip the case of each ASCII letter.
fn scramble_case(s: &str, mask: u64) -> String {
    s.chars()
        .enumerate()
        .map(|(i, c)| {
            if mask & (1 << (i % 64)) != 0 {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

fn response(method: &str) -> Frame {
    Frame::response(Response {
        request_id: "r".into(),
        method: method.into(),
        object_id: None,
        data: Payload::default(),
    })
}

fn change(object_type: &str, operation: &str) -> Frame {
    Frame::change(Change {
        operation: operation.into(),
        object: ChangeObject {
            kind: object_type.into(),
            id: String::new(),
            url: String::new(),
        },
        data: Payload::default(),
    })
}

fn dispatch_count(key: &str, frame: Frame) -> usize {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registry
            .add(key, move |_frame: Arc<Frame>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        registry.dispatch(Arc::new(frame)).await;
        hits.load(Ordering::SeqCst)
    })
}

// --- Key derivation ---

proptest! {
    #[test]
    fn response_key_is_lowercased_method(method in arb_method()) {
        prop_assert_eq!(response(&method).dispatch_key(), Some(method.to_lowercase()));
    }

    #[test]
    fn change_key_is_lowercased_type_dot_operation(
        object_type in arb_object_type(),
        operation in arb_operation(),
    ) {
        let expected = format!("{}.{}", object_type, operation).to_lowercase();
        prop_assert_eq!(change(&object_type, &operation).dispatch_key(), Some(expected.clone()));
        prop_assert_eq!(change_key(&object_type, &operation), expected);
    }

    #[test]
    fn keys_match_regardless_of_case(method in arb_method(), mask in any::<u64>()) {
        let registered = scramble_case(&method, mask);
        prop_assert_eq!(dispatch_count(&registered, response(&method)), 1);
    }

    #[test]
    fn change_subscribers_match_regardless_of_case(
        object_type in arb_object_type(),
        operation in arb_operation(),
        mask in any::<u64>(),
    ) {
        let registered = scramble_case(&format!("{object_type}.{operation}"), mask);
        prop_assert_eq!(dispatch_count(&registered, change(&object_type, &operation)), 1);
    }
}

// --- Decode resilience ---

proptest! {
    #[test]
    fn decode_never_panics(text in ".{0,256}") {
        let _ = Frame::decode(&text);
    }

    #[test]
    fn unknown_frame_types_have_no_key(kind in "[a-z]{1,12}") {
        prop_assume!(kind != "response" && kind != "change");
        let text = serde_json::json!({"type": kind, "body": {"method": "Counter.read"}}).to_string();
        let frame = Frame::decode(&text).unwrap();
        prop_assert_eq!(frame.dispatch_key(), None);
    }
}

// --- Request ids ---

proptest! {
    #[test]
    fn request_ids_are_unique(count in 1usize..500) {
        let ids: HashSet<String> = (0..count)
            .map(|_| Request::new(methods::COUNTER_READ).request_id)
            .collect();
        prop_assert_eq!(ids.len(), count);
    }
}
